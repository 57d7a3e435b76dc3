use tracing::{debug, trace};

use crate::blob_finder::Blob;
use crate::point_cloud::Point3;

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Largest centroid displacement between frames that keeps an identity, in meters.
    pub match_distance: f32,
    /// Frames an identity may go unmatched before it is retired.
    pub grace_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_distance: 0.3,
            grace_frames: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackedState {
    /// First frame of a new identity.
    Entering,
    /// Matched in the latest frame.
    Active,
    /// Unmatched, waiting out the grace period.
    Exiting,
}

/// A blob with an identity that persists across frames.
#[derive(Clone, Debug)]
pub struct TrackedBlob {
    pub id: u32,
    pub state: TrackedState,
    /// Latest matched detection.
    pub blob: Blob,
    /// Index of the latest matched detection in its frame.
    pub order: usize,
    pub frames_since_seen: u32,
    trajectory: Vec<Point3>,
}

impl TrackedBlob {
    fn new(id: u32, blob: Blob, order: usize) -> Self {
        Self {
            id,
            state: TrackedState::Entering,
            trajectory: vec![blob.centroid],
            blob,
            order,
            frames_since_seen: 0,
        }
    }

    fn update(&mut self, blob: Blob, order: usize) {
        self.trajectory.push(blob.centroid);
        self.blob = blob;
        self.order = order;
        self.state = TrackedState::Active;
        self.frames_since_seen = 0;
    }

    pub fn centroid(&self) -> Point3 {
        self.blob.centroid
    }

    pub fn trajectory(&self) -> &[Point3] {
        &self.trajectory
    }
}

/// Identity transitions produced by one call to [`BlobTracker::track_blobs`].
#[derive(Clone, Debug, PartialEq)]
pub enum BlobEvent {
    On { centroid: Point3, id: u32, order: usize },
    Moved { centroid: Point3, id: u32, order: usize },
    Off { centroid: Point3, id: u32, order: usize },
}

impl BlobEvent {
    pub fn id(&self) -> u32 {
        match self {
            BlobEvent::On { id, .. } | BlobEvent::Moved { id, .. } | BlobEvent::Off { id, .. } => *id,
        }
    }

    pub fn order(&self) -> usize {
        match self {
            BlobEvent::On { order, .. } | BlobEvent::Moved { order, .. } | BlobEvent::Off { order, .. } => *order,
        }
    }

    pub fn centroid(&self) -> Point3 {
        match self {
            BlobEvent::On { centroid, .. } | BlobEvent::Moved { centroid, .. } | BlobEvent::Off { centroid, .. } => {
                *centroid
            }
        }
    }

    pub fn dispatch<L: BlobListener + ?Sized>(&self, listener: &mut L) {
        match *self {
            BlobEvent::On { centroid, id, order } => listener.blob_on(centroid, id, order),
            BlobEvent::Moved { centroid, id, order } => listener.blob_moved(centroid, id, order),
            BlobEvent::Off { centroid, id, order } => listener.blob_off(centroid, id, order),
        }
    }
}

/// Callback view of the tracker's events.
pub trait BlobListener {
    fn blob_on(&mut self, centroid: Point3, id: u32, order: usize);
    fn blob_moved(&mut self, centroid: Point3, id: u32, order: usize);
    fn blob_off(&mut self, centroid: Point3, id: u32, order: usize);
}

/// Keeps blob identities stable from one frame to the next.
///
/// Matching is greedy and nearest-first over every (identity, detection) pair
/// closer than `match_distance`; equal distances go to the lower identity.
/// Identities start at 1, only increase, and are never handed out again once
/// retired.
pub struct BlobTracker {
    config: TrackerConfig,
    tracked: Vec<TrackedBlob>,
    next_id: u32,
    frame_count: u64,
}

impl BlobTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracked: Vec::new(),
            next_id: 1,
            frame_count: 0,
        }
    }

    /// Matches `blobs` (one frame's detections, in finder order) against the
    /// registry and returns the resulting transitions: one `Moved` or `On` per
    /// detection in detection order, followed by `Off` for retired identities.
    pub fn track_blobs(&mut self, blobs: &[Blob]) -> Vec<BlobEvent> {
        self.frame_count += 1;

        let mut pairs: Vec<(f32, u32, usize, usize)> = Vec::new();
        for (ti, tracked) in self.tracked.iter().enumerate() {
            for (bi, blob) in blobs.iter().enumerate() {
                let distance = (blob.centroid - tracked.centroid()).norm();
                if distance < self.config.match_distance {
                    pairs.push((distance, tracked.id, ti, bi));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.3.cmp(&b.3)));

        let mut track_for_blob: Vec<Option<usize>> = vec![None; blobs.len()];
        let mut track_taken = vec![false; self.tracked.len()];
        for (distance, id, ti, bi) in pairs {
            if track_taken[ti] || track_for_blob[bi].is_some() {
                continue;
            }
            trace!("Matched id {} to detection {} at {:.3}m", id, bi, distance);
            track_taken[ti] = true;
            track_for_blob[bi] = Some(ti);
        }

        let mut previous: Vec<Option<TrackedBlob>> = self.tracked.drain(..).map(Some).collect();
        let mut current = Vec::with_capacity(blobs.len());
        let mut events = Vec::with_capacity(blobs.len());

        for (order, blob) in blobs.iter().enumerate() {
            let tracked = match track_for_blob[order].and_then(|ti| previous[ti].take()) {
                Some(mut tracked) => {
                    tracked.update(blob.clone(), order);
                    events.push(BlobEvent::Moved {
                        centroid: blob.centroid,
                        id: tracked.id,
                        order,
                    });
                    tracked
                }
                None => {
                    let tracked = TrackedBlob::new(self.next_id, blob.clone(), order);
                    self.next_id += 1;
                    debug!("New blob id {} at order {}", tracked.id, order);
                    events.push(BlobEvent::On {
                        centroid: blob.centroid,
                        id: tracked.id,
                        order,
                    });
                    tracked
                }
            };
            current.push(tracked);
        }

        for mut lost in previous.into_iter().flatten() {
            lost.frames_since_seen += 1;
            if lost.frames_since_seen > self.config.grace_frames {
                debug!("Blob id {} retired after {} unseen frames", lost.id, lost.frames_since_seen);
                events.push(BlobEvent::Off {
                    centroid: lost.centroid(),
                    id: lost.id,
                    order: lost.order,
                });
            } else {
                lost.state = TrackedState::Exiting;
                current.push(lost);
            }
        }

        self.tracked = current;
        events
    }

    /// Retires every identity, as if an empty frame had arrived with no grace period.
    pub fn retire_all(&mut self) -> Vec<BlobEvent> {
        self.tracked
            .drain(..)
            .map(|lost| BlobEvent::Off {
                centroid: lost.centroid(),
                id: lost.id,
                order: lost.order,
            })
            .collect()
    }

    /// Identities currently held, matched detections first in frame order.
    pub fn blobs(&self) -> &[TrackedBlob] {
        &self.tracked
    }

    pub fn get_by_id(&self, id: u32) -> Option<&TrackedBlob> {
        self.tracked.iter().find(|t| t.id == id)
    }

    /// Centroid history of a live identity, oldest first.
    pub fn trajectory_by_id(&self, id: u32) -> Option<&[Point3]> {
        self.get_by_id(id).map(TrackedBlob::trajectory)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Takes effect on the next frame; held identities are kept.
    pub fn set_config(&mut self, config: TrackerConfig) {
        debug!("Tracker config updated: {:?}", config);
        self.config = config;
    }
}

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::background_model::{foreground_pixels, BackgroundModel, PreprocessConfig};
use crate::blob_finder::{find_blobs, Blob, FinderConfig};
use crate::blob_tracker::{BlobEvent, BlobTracker, TrackerConfig};
use crate::depth_source::{DepthFrame, DepthSource};
use crate::point_cloud::{CoordinateTransform, DepthIntrinsics, PointCloud, Resolution};

/// Pipeline configuration
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub preprocess: PreprocessConfig,
    pub finder: FinderConfig,
    pub tracker: TrackerConfig,
    pub transform: CoordinateTransform,
    pub resolution: Resolution,
    /// Defaults to the Kinect v2 intrinsics rescaled to the frame size.
    pub intrinsics: Option<DepthIntrinsics>,
}

/// Everything one frame produced.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub frame_id: u64,
    pub foreground_pixels: usize,
    pub blobs: Vec<Blob>,
    pub events: Vec<BlobEvent>,
    pub processing_time: Duration,
    /// Time left before a pending background snapshot, if one is pending.
    pub countdown: Option<Duration>,
}

/// Depth frame in, tracked blobs out, one frame at a time.
pub struct BlobPipeline {
    config: PipelineConfig,
    intrinsics: DepthIntrinsics,
    background: BackgroundModel,
    tracker: BlobTracker,
    frame_counter: u64,
}

impl BlobPipeline {
    pub fn new(width: u32, height: u32, config: PipelineConfig) -> Self {
        let intrinsics = config
            .intrinsics
            .unwrap_or_else(|| DepthIntrinsics::for_frame(width, height));

        info!(
            "Blob pipeline for {}x{} frames: resolution step {}, volume {}..{} m3, min {} points, max {} blobs",
            width,
            height,
            config.resolution.step(),
            config.finder.min_volume,
            config.finder.max_volume,
            config.finder.min_points,
            config.finder.max_blobs
        );

        Self {
            intrinsics,
            background: BackgroundModel::new(width, height, config.preprocess.clone()),
            tracker: BlobTracker::new(config.tracker.clone()),
            frame_counter: 0,
            config,
        }
    }

    /// Runs one frame through preprocessing, extraction and tracking.
    pub fn process(&mut self, frame: &DepthFrame, now: Instant) -> Result<FrameReport> {
        let start = Instant::now();
        self.frame_counter += 1;

        let mask = self
            .background
            .update(frame, now)
            .context("Failed to compute foreground mask")?;

        let cloud = PointCloud::from_depth(
            frame,
            &self.intrinsics,
            &self.config.transform,
            self.config.resolution,
        );
        trace!("Point cloud holds {} points", cloud.len());
        let blobs = find_blobs(&mask, &cloud, &self.config.finder).context("Failed to extract blobs")?;
        let events = self.tracker.track_blobs(&blobs);

        let report = FrameReport {
            frame_id: self.frame_counter,
            foreground_pixels: foreground_pixels(&mask),
            blobs,
            events,
            processing_time: start.elapsed(),
            countdown: self.background.countdown(now),
        };
        debug!(
            "Frame {}: {} foreground pixels, {} blobs, {} events in {}ms",
            report.frame_id,
            report.foreground_pixels,
            report.blobs.len(),
            report.events.len(),
            report.processing_time.as_millis()
        );

        Ok(report)
    }

    /// Processes the source's next frame, if it has one ready.
    pub fn poll(&mut self, source: &mut dyn DepthSource, now: Instant) -> Result<Option<FrameReport>> {
        match source.poll_frame().context("Failed to poll depth source")? {
            Some(frame) => self.process(&frame, now).map(Some),
            None => Ok(None),
        }
    }

    pub fn request_recalibration(&mut self, now: Instant) {
        self.background.request_recalibration(now);
    }

    /// Swaps the world transform; existing identities keep their last positions.
    pub fn set_transform(&mut self, transform: CoordinateTransform) {
        info!("Coordinate transform updated: {:?}", transform);
        self.config.transform = transform;
    }

    /// New near/far, noise floor or morphology for the following frames.
    /// The background reference is kept.
    pub fn set_preprocess_config(&mut self, preprocess: PreprocessConfig) {
        info!(
            "Preprocess config updated: near {}m, far {}m, noise floor {}",
            preprocess.near_m, preprocess.far_m, preprocess.noise_floor
        );
        self.background.set_config(preprocess.clone());
        self.config.preprocess = preprocess;
    }

    pub fn set_finder_config(&mut self, finder: FinderConfig) {
        info!("Finder config updated: {:?}", finder);
        self.config.finder = finder;
    }

    pub fn set_tracker_config(&mut self, tracker: TrackerConfig) {
        self.tracker.set_config(tracker.clone());
        self.config.tracker = tracker;
    }

    pub fn tracker(&self) -> &BlobTracker {
        &self.tracker
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Get pipeline statistics
    pub fn get_stats(&self) -> PipelineStats {
        PipelineStats {
            frame_count: self.frame_counter,
            tracked_blobs: self.tracker.blobs().len(),
            is_learning: self.background.is_learning(),
        }
    }
}

#[derive(Debug)]
pub struct PipelineStats {
    pub frame_count: u64,
    pub tracked_blobs: usize,
    pub is_learning: bool,
}

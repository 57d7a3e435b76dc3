use anyhow::Result;
use image::{ImageBuffer, Luma};
use tracing::{debug, info};

/// Depth samples in millimeters; 0 marks a sensor dropout.
pub type DepthFrame = ImageBuffer<Luma<u16>, Vec<u16>>;

/// A capture device that produces depth frames when polled.
///
/// `Ok(None)` means no new frame is ready this cycle, which is not an error.
pub trait DepthSource {
    fn poll_frame(&mut self) -> Result<Option<DepthFrame>>;
    fn resolution(&self) -> (u32, u32);
}

const WALL_DEPTH_MM: f32 = 3500.0;
const FLOOR_NEAR_MM: f32 = 1200.0;
const PERSON_DEPTH_MM: f32 = 2000.0;
const PERSON_BULGE_MM: f32 = 180.0;
const DROPOUT_PERIOD: u32 = 97;

/// Synthetic scene: a back wall, a floor and box-shaped people walking across.
///
/// The scene is empty for the first `warmup_frames` so the background can be
/// learned before anyone enters.
pub struct SimulatedDepthSource {
    width: u32,
    height: u32,
    people: u32,
    frame_count: u64,
    warmup_frames: u64,
    max_frames: Option<u64>,
}

impl SimulatedDepthSource {
    pub fn new(width: u32, height: u32, people: u32) -> Self {
        info!("Using simulated depth source ({}x{}, {} people)", width, height, people);
        Self {
            width,
            height,
            people,
            frame_count: 0,
            warmup_frames: 5,
            max_frames: None,
        }
    }

    pub fn with_warmup(mut self, frames: u64) -> Self {
        self.warmup_frames = frames;
        self
    }

    /// Stops producing frames after `frames` polls.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn background_depth(&self, y: u32) -> f32 {
        let floor_start = self.height * 3 / 4;
        if y < floor_start {
            return WALL_DEPTH_MM;
        }
        let t = (y - floor_start) as f32 / (self.height - floor_start).max(1) as f32;
        WALL_DEPTH_MM + (FLOOR_NEAR_MM - WALL_DEPTH_MM) * t
    }

    /// Horizontal span and depth profile of each visible person.
    fn person_columns(&self) -> Vec<(f32, f32)> {
        if self.frame_count <= self.warmup_frames {
            return Vec::new();
        }
        let walked = (self.frame_count - self.warmup_frames) as f32;
        let lane = self.width as f32 / self.people.max(1) as f32;

        (0..self.people)
            .map(|i| {
                let speed = 1.5 + i as f32 * 0.5;
                let x = (lane * i as f32 + lane / 2.0 + walked * speed) % self.width as f32;
                (x, self.width as f32 / 16.0)
            })
            .collect()
    }

    fn generate_frame(&self) -> DepthFrame {
        let mut frame = DepthFrame::new(self.width, self.height);
        let people = self.person_columns();
        let head = self.height / 4;
        let feet = self.height * 3 / 4 + self.height / 16;

        for (x, y, pixel) in frame.enumerate_pixels_mut() {
            if (x * 7 + y * 13 + self.frame_count as u32) % DROPOUT_PERIOD == 0 {
                *pixel = Luma([0]);
                continue;
            }

            let mut depth = self.background_depth(y);
            if (head..feet).contains(&y) {
                for &(center, half_width) in &people {
                    let t = (x as f32 - center) / half_width;
                    if t.abs() < 1.0 {
                        // round front so the body has thickness along the viewing axis
                        let body = PERSON_DEPTH_MM + PERSON_BULGE_MM * (1.0 - (1.0 - t * t).sqrt());
                        depth = depth.min(body);
                    }
                }
            }
            *pixel = Luma([depth as u16]);
        }

        frame
    }
}

impl DepthSource for SimulatedDepthSource {
    fn poll_frame(&mut self) -> Result<Option<DepthFrame>> {
        if self.max_frames.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        self.frame_count += 1;
        let frame = self.generate_frame();
        debug!("Generated simulated depth frame {}: {}x{}", self.frame_count, self.width, self.height);
        Ok(Some(frame))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

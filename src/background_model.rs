use anyhow::{ensure, Result};
use image::{GrayImage, Luma};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::depth_source::DepthFrame;

const DEFAULT_NEAR_M: f32 = 0.5;
const DEFAULT_FAR_M: f32 = 3.0;
const DEFAULT_NOISE_FLOOR: u8 = 3;

#[derive(Clone, Debug)]
pub struct PreprocessConfig {
    /// Depth mapped to full brightness, in meters.
    pub near_m: f32,
    /// Depth mapped to black, in meters.
    pub far_m: f32,
    /// Differences at or below this many gray levels are ignored.
    pub noise_floor: u8,
    /// Passes of 3x3 erosion.
    pub erode_iterations: u32,
    /// Passes of 3x3 dilation.
    pub dilate_iterations: u32,
    /// Wait between a recalibration request and the background snapshot.
    pub recalibration_delay: Duration,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            near_m: DEFAULT_NEAR_M,
            far_m: DEFAULT_FAR_M,
            noise_floor: DEFAULT_NOISE_FLOOR,
            erode_iterations: 2,
            dilate_iterations: 1,
            recalibration_delay: Duration::ZERO,
        }
    }
}

/// Renders depth as 8-bit gray: `near` is 255, `far` is 0, dropouts stay 0.
pub fn depth_to_gray(frame: &DepthFrame, near_m: f32, far_m: f32) -> GrayImage {
    let near = near_m * 1000.0;
    let far = far_m * 1000.0;
    let span = far - near;

    GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let depth = frame.get_pixel(x, y)[0];
        if depth == 0 || span.abs() < f32::EPSILON {
            return Luma([0]);
        }
        let t = ((depth as f32 - near) / span).clamp(0.0, 1.0);
        Luma([(255.0 * (1.0 - t)).round() as u8])
    })
}

/// Foreground mask of `current` against `background`.
///
/// Absolute gray difference, eroded then dilated, then thresholded above the
/// noise floor. Pixels with a dropout in either frame take no part in the
/// morphology and never count as foreground.
pub fn compute_mask(current: &DepthFrame, background: &DepthFrame, config: &PreprocessConfig) -> Result<GrayImage> {
    ensure!(
        current.dimensions() == background.dimensions(),
        "Frame is {:?} but background is {:?}",
        current.dimensions(),
        background.dimensions()
    );

    let current_gray = depth_to_gray(current, config.near_m, config.far_m);
    let background_gray = depth_to_gray(background, config.near_m, config.far_m);

    let valid: Vec<bool> = current
        .pixels()
        .zip(background.pixels())
        .map(|(c, b)| c[0] != 0 && b[0] != 0)
        .collect();

    let diff = GrayImage::from_fn(current.width(), current.height(), |x, y| {
        let a = current_gray.get_pixel(x, y)[0];
        let b = background_gray.get_pixel(x, y)[0];
        Luma([a.abs_diff(b)])
    });

    let eroded = morphology(&diff, Some(valid.as_slice()), config.erode_iterations, 255, u8::min);
    let mut mask = morphology(&eroded, Some(valid.as_slice()), config.dilate_iterations, 0, u8::max);
    for (pixel, &ok) in mask.pixels_mut().zip(&valid) {
        pixel[0] = if ok && pixel[0] > config.noise_floor { 255 } else { 0 };
    }

    Ok(mask)
}

/// Grayscale erosion: `iterations` passes of a 3x3 minimum filter.
///
/// Out-of-bounds neighbours are ignored so borders are not eaten away.
pub fn erode(image: &GrayImage, iterations: u32) -> GrayImage {
    morphology(image, None, iterations, 255, u8::min)
}

/// Grayscale dilation: `iterations` passes of a 3x3 maximum filter.
pub fn dilate(image: &GrayImage, iterations: u32) -> GrayImage {
    morphology(image, None, iterations, 0, u8::max)
}

/// Repeated 3x3 min/max filter. Pixels marked invalid are skipped like
/// out-of-bounds ones in every pass and come out as 0.
fn morphology(
    image: &GrayImage,
    valid: Option<&[bool]>,
    iterations: u32,
    identity: u8,
    pick: fn(u8, u8) -> u8,
) -> GrayImage {
    let (width, height) = image.dimensions();
    let is_valid = |x: u32, y: u32| valid.is_none_or(|v| v[(y * width + x) as usize]);

    let mut result = GrayImage::from_fn(width, height, |x, y| {
        if is_valid(x, y) {
            *image.get_pixel(x, y)
        } else {
            Luma([0])
        }
    });

    for _ in 0..iterations {
        let previous = result;
        result = GrayImage::from_fn(width, height, |x, y| {
            if !is_valid(x, y) {
                return Luma([0]);
            }
            let mut value = identity;
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    if is_valid(nx, ny) {
                        value = pick(value, previous.get_pixel(nx, ny)[0]);
                    }
                }
            }
            Luma([value])
        });
    }

    result
}

pub fn foreground_pixels(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}

/// Frozen background reference plus the recalibration countdown.
///
/// A new model is in the learning state, so the first frame it sees becomes
/// the background. After that the reference only changes on request.
pub struct BackgroundModel {
    config: PreprocessConfig,
    width: u32,
    height: u32,
    background: Option<DepthFrame>,
    learning: bool,
    recalibrate_at: Option<Instant>,
}

impl BackgroundModel {
    pub fn new(width: u32, height: u32, config: PreprocessConfig) -> Self {
        Self {
            config,
            width,
            height,
            background: None,
            learning: true,
            recalibrate_at: None,
        }
    }

    /// Snapshots the background on or after the configured delay from `now`.
    pub fn request_recalibration(&mut self, now: Instant) {
        self.learning = true;
        self.recalibrate_at = Some(now + self.config.recalibration_delay);
        info!(
            "Background recalibration requested ({}ms countdown)",
            self.config.recalibration_delay.as_millis()
        );
    }

    /// Replaces the background with `frame` immediately.
    pub fn recalibrate_now(&mut self, frame: &DepthFrame) -> Result<()> {
        self.check_dimensions(frame)?;
        self.background = Some(frame.clone());
        self.learning = false;
        self.recalibrate_at = None;
        info!("Background reference captured ({}x{})", self.width, self.height);
        Ok(())
    }

    /// Takes a pending background snapshot if it is due, then returns the
    /// foreground mask of `frame`. Before any background exists the mask is empty.
    pub fn update(&mut self, frame: &DepthFrame, now: Instant) -> Result<GrayImage> {
        self.check_dimensions(frame)?;

        if self.learning && self.recalibrate_at.is_none_or(|at| now >= at) {
            self.recalibrate_now(frame)?;
        }

        match &self.background {
            Some(background) => compute_mask(frame, background, &self.config),
            None => {
                debug!("No background yet, returning empty mask");
                Ok(GrayImage::new(self.width, self.height))
            }
        }
    }

    fn check_dimensions(&self, frame: &DepthFrame) -> Result<()> {
        ensure!(
            frame.dimensions() == (self.width, self.height),
            "Depth frame is {:?}, background model expects {}x{}",
            frame.dimensions(),
            self.width,
            self.height
        );
        Ok(())
    }

    pub fn is_learning(&self) -> bool {
        self.learning
    }

    /// Time left before a pending recalibration fires.
    pub fn countdown(&self, now: Instant) -> Option<Duration> {
        if !self.learning {
            return None;
        }
        Some(self.recalibrate_at.map_or(Duration::ZERO, |at| at.saturating_duration_since(now)))
    }

    pub fn background(&self) -> Option<&DepthFrame> {
        self.background.as_ref()
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: PreprocessConfig) {
        self.config = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_frame(width: u32, height: u32, depth: u16) -> DepthFrame {
        DepthFrame::from_pixel(width, height, Luma([depth]))
    }

    fn with_box(mut frame: DepthFrame, x0: u32, y0: u32, size: u32, depth: u16) -> DepthFrame {
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                frame.put_pixel(x, y, Luma([depth]));
            }
        }
        frame
    }

    #[test]
    fn test_depth_to_gray_mapping() {
        let mut frame = flat_frame(3, 1, 500);
        frame.put_pixel(1, 0, Luma([3000]));
        frame.put_pixel(2, 0, Luma([0]));

        let gray = depth_to_gray(&frame, 0.5, 3.0);
        assert_eq!(gray.get_pixel(0, 0)[0], 255);
        assert_eq!(gray.get_pixel(1, 0)[0], 0);
        assert_eq!(gray.get_pixel(2, 0)[0], 0);
    }

    #[test]
    fn test_same_frame_gives_empty_mask() {
        let frame = with_box(flat_frame(32, 32, 2500), 8, 8, 10, 1200);
        let mask = compute_mask(&frame, &frame, &PreprocessConfig::default()).unwrap();
        assert_eq!(foreground_pixels(&mask), 0);
    }

    #[test]
    fn test_object_in_front_of_background_is_foreground() {
        let background = flat_frame(32, 32, 2500);
        let current = with_box(background.clone(), 8, 8, 10, 1200);

        let mask = compute_mask(&current, &background, &PreprocessConfig::default()).unwrap();
        // erode by 2 then dilate by 1 leaves the inner 8x8
        assert_eq!(foreground_pixels(&mask), 64);
        assert_eq!(mask.get_pixel(12, 12)[0], 255);
        assert_eq!(mask.get_pixel(8, 8)[0], 0);
    }

    #[test]
    fn test_isolated_noise_is_eroded_away() {
        let background = flat_frame(32, 32, 2500);
        let current = with_box(background.clone(), 10, 10, 2, 1000);

        let mask = compute_mask(&current, &background, &PreprocessConfig::default()).unwrap();
        assert_eq!(foreground_pixels(&mask), 0);
    }

    #[test]
    fn test_dropout_is_not_foreground() {
        let background = flat_frame(32, 32, 2500);
        let current = with_box(background.clone(), 8, 8, 10, 0);

        let mask = compute_mask(&current, &background, &PreprocessConfig::default()).unwrap();
        assert_eq!(foreground_pixels(&mask), 0);

        // and a dropout in the background hides whatever appears there later
        let mask = compute_mask(&background, &current, &PreprocessConfig::default()).unwrap();
        assert_eq!(foreground_pixels(&mask), 0);
    }

    #[test]
    fn test_scattered_dropouts_do_not_fragment_object() {
        let mut background = flat_frame(32, 32, 2500);
        let mut current = with_box(background.clone(), 8, 8, 10, 1200);
        background.put_pixel(11, 11, Luma([0]));
        current.put_pixel(14, 13, Luma([0]));

        let mask = compute_mask(&current, &background, &PreprocessConfig::default()).unwrap();
        assert_eq!(foreground_pixels(&mask), 62);
        assert_eq!(mask.get_pixel(11, 11)[0], 0);
        assert_eq!(mask.get_pixel(12, 12)[0], 255);
    }

    #[test]
    fn test_erode_then_dilate_opens_image() {
        let mut image = GrayImage::new(9, 9);
        for y in 2..7 {
            for x in 2..7 {
                image.put_pixel(x, y, Luma([200]));
            }
        }
        image.put_pixel(0, 0, Luma([200]));

        let eroded = erode(&image, 1);
        assert_eq!(foreground_pixels(&eroded), 9);
        let opened = dilate(&eroded, 1);
        assert_eq!(foreground_pixels(&opened), 25);
        assert_eq!(opened.get_pixel(0, 0)[0], 0);
        assert_eq!(erode(&image, 0), image);
    }

    #[test]
    fn test_dropout_column_blocks_each_pass() {
        let mut image = GrayImage::from_pixel(5, 5, Luma([200]));
        image.put_pixel(2, 2, Luma([0]));
        let valid: Vec<bool> = (0..25).map(|i| i % 5 != 1).collect();

        let eroded = morphology(&image, Some(valid.as_slice()), 2, 255, u8::min);
        // the dark pixel cannot travel across the invalid column in 3x3 steps
        assert_eq!(eroded.get_pixel(0, 2)[0], 200);
        assert_eq!(eroded.get_pixel(1, 2)[0], 0);
        assert_eq!(eroded.get_pixel(3, 2)[0], 0);
        assert_eq!(eroded.get_pixel(4, 0)[0], 0);

        // without the dropout column two passes reach two pixels away
        assert_eq!(erode(&image, 2).get_pixel(0, 2)[0], 0);
    }

    #[test]
    fn test_mismatched_dimensions_error() {
        let a = flat_frame(8, 8, 1000);
        let b = flat_frame(8, 9, 1000);
        assert!(compute_mask(&a, &b, &PreprocessConfig::default()).is_err());
    }

    #[test]
    fn test_first_frame_becomes_background() {
        let mut model = BackgroundModel::new(32, 32, PreprocessConfig::default());
        assert!(model.is_learning());

        let frame = with_box(flat_frame(32, 32, 2500), 4, 4, 12, 1500);
        let mask = model.update(&frame, Instant::now()).unwrap();
        assert_eq!(foreground_pixels(&mask), 0);
        assert!(!model.is_learning());
        assert_eq!(model.background(), Some(&frame));
    }

    #[test]
    fn test_mask_is_empty_before_background_exists() {
        let config = PreprocessConfig {
            recalibration_delay: Duration::from_millis(500),
            ..Default::default()
        };
        let mut model = BackgroundModel::new(32, 32, config);
        let frame = with_box(flat_frame(32, 32, 2500), 8, 8, 10, 1200);
        let now = Instant::now();

        model.request_recalibration(now);
        let mask = model.update(&frame, now).unwrap();
        assert_eq!(mask.dimensions(), (32, 32));
        assert_eq!(foreground_pixels(&mask), 0);
        assert!(model.background().is_none());
        assert!(model.is_learning());

        model.update(&frame, now + Duration::from_millis(500)).unwrap();
        assert_eq!(model.background(), Some(&frame));
    }

    #[test]
    fn test_background_only_changes_on_request() {
        let mut model = BackgroundModel::new(32, 32, PreprocessConfig::default());
        let empty = flat_frame(32, 32, 2500);
        let occupied = with_box(empty.clone(), 8, 8, 10, 1200);
        let now = Instant::now();

        model.update(&empty, now).unwrap();
        for _ in 0..3 {
            let mask = model.update(&occupied, now).unwrap();
            assert!(foreground_pixels(&mask) > 0);
        }

        model.request_recalibration(now);
        let mask = model.update(&occupied, now).unwrap();
        assert_eq!(foreground_pixels(&mask), 0);
    }

    #[test]
    fn test_recalibration_waits_for_countdown() {
        let config = PreprocessConfig {
            recalibration_delay: Duration::from_millis(500),
            ..Default::default()
        };
        let mut model = BackgroundModel::new(32, 32, config);
        let empty = flat_frame(32, 32, 2500);
        let occupied = with_box(empty.clone(), 8, 8, 10, 1200);
        let start = Instant::now();

        model.recalibrate_now(&empty).unwrap();
        model.request_recalibration(start);
        assert_eq!(model.countdown(start), Some(Duration::from_millis(500)));

        let mask = model.update(&occupied, start + Duration::from_millis(100)).unwrap();
        assert!(foreground_pixels(&mask) > 0);
        assert!(model.is_learning());

        let mask = model.update(&occupied, start + Duration::from_millis(600)).unwrap();
        assert_eq!(foreground_pixels(&mask), 0);
        assert_eq!(model.countdown(start), None);
    }
}

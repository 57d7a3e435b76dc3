use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};
use nalgebra::Vector3;
use std::time::Duration;

use crate::background_model::PreprocessConfig;
use crate::blob_finder::{min_points_for, FinderConfig};
use crate::blob_tracker::TrackerConfig;
use crate::pipeline::PipelineConfig;
use crate::point_cloud::CoordinateTransform;

#[derive(Parser, Debug)]
#[command(name = "depth-blobs")]
#[command(about = "Finds and tracks 3D blobs in depth camera frames")]
#[command(long_about = "Subtracts a learned background from depth frames, clusters the remaining points into 3D blobs and keeps their identities stable across frames. Runs against a simulated depth scene and logs blob on/moved/off events.")]
pub struct Args {
    #[arg(long = "width", default_value = "512", help = "Depth frame width in pixels")]
    pub width: u32,

    #[arg(long = "height", default_value = "424", help = "Depth frame height in pixels")]
    pub height: u32,

    #[arg(long = "fps", default_value = "30", help = "Target frames per second")]
    pub fps: u32,

    #[arg(
        short = 'n',
        long = "frames",
        default_value = "300",
        help = "Number of frames to process (0 runs until interrupted)"
    )]
    pub frames: u64,

    #[arg(long = "people", default_value = "2", help = "People walking through the simulated scene")]
    pub people: u32,

    #[arg(long = "near", default_value = "0.5", help = "Near depth threshold in meters")]
    pub near: f32,

    #[arg(long = "far", default_value = "3.0", help = "Far depth threshold in meters")]
    pub far: f32,

    #[arg(
        long = "noise-floor",
        default_value = "3",
        help = "Gray-level difference ignored by background subtraction"
    )]
    pub noise_floor: u8,

    #[arg(
        long = "background-delay-ms",
        default_value = "0",
        help = "Countdown before the background snapshot is taken"
    )]
    pub background_delay_ms: u64,

    #[arg(
        long = "tilt",
        default_value = "0",
        allow_negative_numbers = true,
        help = "Sensor tilt around the X axis in degrees"
    )]
    pub tilt: f32,

    #[arg(long = "resolution", default_value = "low", help = "Point cloud sampling resolution")]
    pub resolution: Resolution,

    #[arg(
        long = "crop-min",
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_values_t = [-10.0, -10.0, -10.0],
        help = "Crop box minimum corner x,y,z in meters"
    )]
    pub crop_min: Vec<f32>,

    #[arg(
        long = "crop-max",
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_values_t = [10.0, 10.0, 10.0],
        help = "Crop box maximum corner x,y,z in meters"
    )]
    pub crop_max: Vec<f32>,

    #[arg(
        long = "thresh-3d",
        value_delimiter = ',',
        default_values_t = [0.2, 0.2, 0.3],
        help = "Per-axis merge distance x,y,z in meters"
    )]
    pub thresh_3d: Vec<f32>,

    #[arg(long = "thresh-2d", default_value = "1", help = "Neighbourhood search range in grid cells")]
    pub thresh_2d: u32,

    #[arg(long = "min-volume", default_value = "0.02", help = "Minimum blob volume in cubic meters")]
    pub min_volume: f32,

    #[arg(long = "max-volume", default_value = "2.0", help = "Maximum blob volume in cubic meters")]
    pub max_volume: f32,

    #[arg(long = "min-points", help = "Minimum points per blob (default scales with frame size)")]
    pub min_points: Option<usize>,

    #[arg(long = "max-blobs", default_value = "10", help = "Maximum blobs reported per frame")]
    pub max_blobs: usize,

    #[arg(
        long = "match-distance",
        default_value = "0.3",
        help = "Largest centroid move between frames that keeps an identity, in meters"
    )]
    pub match_distance: f32,

    #[arg(
        long = "grace-frames",
        default_value = "0",
        help = "Frames a lost blob is kept before it is retired"
    )]
    pub grace_frames: u32,

    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help = "Increase verbosity level (use multiple times for more verbose output)"
    )]
    pub verbose: u8,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Resolution {
    #[value(name = "high")]
    High,
    #[value(name = "medium")]
    Medium,
    #[value(name = "low")]
    Low,
}

impl From<Resolution> for crate::point_cloud::Resolution {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::High => crate::point_cloud::Resolution::High,
            Resolution::Medium => crate::point_cloud::Resolution::Medium,
            Resolution::Low => crate::point_cloud::Resolution::Low,
        }
    }
}

fn vec3(values: &[f32], flag: &str) -> Result<Vector3<f32>> {
    ensure!(values.len() == 3, "--{} takes three comma-separated values, got {}", flag, values.len());
    Ok(Vector3::new(values[0], values[1], values[2]))
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let resolution: crate::point_cloud::Resolution = self.resolution.into();

        let finder = FinderConfig {
            crop_box_min: vec3(&self.crop_min, "crop-min")?,
            crop_box_max: vec3(&self.crop_max, "crop-max")?,
            thresh_3d: vec3(&self.thresh_3d, "thresh-3d")?,
            thresh_2d: self.thresh_2d,
            min_volume: self.min_volume,
            max_volume: self.max_volume,
            min_points: self
                .min_points
                .unwrap_or_else(|| min_points_for(self.width, self.height, resolution)),
            max_blobs: self.max_blobs,
        };

        Ok(PipelineConfig {
            preprocess: PreprocessConfig {
                near_m: self.near,
                far_m: self.far,
                noise_floor: self.noise_floor,
                recalibration_delay: Duration::from_millis(self.background_delay_ms),
                ..Default::default()
            },
            finder,
            tracker: TrackerConfig {
                match_distance: self.match_distance,
                grace_frames: self.grace_frames,
            },
            transform: CoordinateTransform::default().with_tilt(self.tilt),
            resolution,
            intrinsics: None,
        })
    }

    pub fn setup_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, FmtSubscriber};

        let level = match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };

        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_defaults() {
        let args = Args::parse_from(["depth-blobs"]);
        let config = args.pipeline_config().unwrap();
        let defaults = FinderConfig::default();

        assert_eq!(config.finder.crop_box_min, defaults.crop_box_min);
        assert_eq!(config.finder.crop_box_max, defaults.crop_box_max);
        assert_eq!(config.finder.thresh_3d, defaults.thresh_3d);
        assert_eq!(config.finder.min_points, defaults.min_points);
        assert_eq!(config.resolution, crate::point_cloud::Resolution::Low);
        assert_eq!(config.tracker.grace_frames, 0);
    }

    #[test]
    fn test_negative_crop_corner_parses() {
        let args = Args::parse_from(["depth-blobs", "--crop-min", "-1.5,-2,0", "--tilt", "-10"]);
        let config = args.pipeline_config().unwrap();
        assert_eq!(config.finder.crop_box_min, Vector3::new(-1.5, -2.0, 0.0));
        assert_eq!(config.transform.rotation_deg.x, -10.0);
    }

    #[test]
    fn test_wrong_vector_length_is_rejected() {
        let args = Args::parse_from(["depth-blobs", "--thresh-3d", "0.2,0.2"]);
        assert!(args.pipeline_config().is_err());
    }

    #[test]
    fn test_min_points_scales_with_resolution() {
        let args = Args::parse_from(["depth-blobs", "--resolution", "high"]);
        assert_eq!(args.pipeline_config().unwrap().finder.min_points, 217);
    }
}

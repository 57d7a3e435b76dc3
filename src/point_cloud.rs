use anyhow::{ensure, Result};
use nalgebra::{Rotation3, Vector3};
use tracing::debug;

use crate::depth_source::DepthFrame;

pub type Point3 = Vector3<f32>;

/// Native depth resolution of the Kinect v2 sensor the default intrinsics were measured at.
pub const BASE_WIDTH: u32 = 512;
pub const BASE_HEIGHT: u32 = 424;

/// Pixel sampling step used when building the point cloud.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Resolution {
    High,
    Medium,
    #[default]
    Low,
}

impl Resolution {
    pub fn step(self) -> u32 {
        match self {
            Resolution::High => 1,
            Resolution::Medium => 2,
            Resolution::Low => 4,
        }
    }
}

/// Pinhole intrinsics of the depth camera, in pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl DepthIntrinsics {
    pub const KINECT_V2: Self = Self {
        fx: 365.456,
        fy: 365.456,
        cx: 254.878,
        cy: 205.395,
    };

    /// Rescales the Kinect v2 intrinsics to a frame of a different size.
    pub fn for_frame(width: u32, height: u32) -> Self {
        let sx = width as f32 / BASE_WIDTH as f32;
        let sy = height as f32 / BASE_HEIGHT as f32;
        Self {
            fx: Self::KINECT_V2.fx * sx,
            fy: Self::KINECT_V2.fy * sy,
            cx: Self::KINECT_V2.cx * sx,
            cy: Self::KINECT_V2.cy * sy,
        }
    }

    /// Camera-space position in millimeters of pixel (u, v) at `depth_mm`.
    pub fn unproject(&self, u: u32, v: u32, depth_mm: f32) -> Point3 {
        let x = (u as f32 - self.cx) * depth_mm / self.fx;
        let y = (v as f32 - self.cy) * depth_mm / self.fy;
        Point3::new(x, y, depth_mm)
    }
}

impl Default for DepthIntrinsics {
    fn default() -> Self {
        Self::KINECT_V2
    }
}

/// Maps camera-space millimeters into the world frame the blobs are measured in.
///
/// The transform is `R * (p .* scale) + translation`, with `R` built from
/// Euler angles in degrees applied about X, then Y, then Z. In standardized
/// mode the camera axes are first reordered so that x points right, y points
/// away from the sensor and z points up (against gravity).
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinateTransform {
    pub rotation_deg: Vector3<f32>,
    pub translation: Vector3<f32>,
    pub scale: Vector3<f32>,
    pub standardized: bool,
}

impl Default for CoordinateTransform {
    fn default() -> Self {
        Self {
            rotation_deg: Vector3::zeros(),
            translation: Vector3::zeros(),
            // millimeters to meters
            scale: Vector3::repeat(0.001),
            standardized: true,
        }
    }
}

impl CoordinateTransform {
    pub fn with_tilt(mut self, degrees: f32) -> Self {
        self.rotation_deg.x = degrees;
        self
    }

    pub fn rotation(&self) -> Rotation3<f32> {
        let r = self.rotation_deg.map(f32::to_radians);
        Rotation3::from_euler_angles(r.x, r.y, r.z)
    }

    pub fn apply(&self, camera_mm: Point3) -> Point3 {
        self.apply_with(&self.rotation(), camera_mm)
    }

    fn apply_with(&self, rotation: &Rotation3<f32>, camera_mm: Point3) -> Point3 {
        let p = if self.standardized {
            Point3::new(camera_mm.x, camera_mm.z, -camera_mm.y)
        } else {
            camera_mm
        };
        rotation * p.component_mul(&self.scale) + self.translation
    }
}

/// World-space points sampled from a depth frame on a regular grid.
///
/// Grid cell (gx, gy) corresponds to source pixel (gx * step, gy * step).
/// Cells whose depth sample was a dropout have no point.
#[derive(Clone, Debug)]
pub struct PointCloud {
    source_width: u32,
    source_height: u32,
    step: u32,
    width: u32,
    height: u32,
    points: Vec<Option<Point3>>,
}

impl PointCloud {
    pub fn from_depth(
        frame: &DepthFrame,
        intrinsics: &DepthIntrinsics,
        transform: &CoordinateTransform,
        resolution: Resolution,
    ) -> Self {
        let (source_width, source_height) = frame.dimensions();
        let step = resolution.step();
        let width = source_width.div_ceil(step);
        let height = source_height.div_ceil(step);
        let rotation = transform.rotation();

        let mut points = Vec::with_capacity((width * height) as usize);
        let mut valid = 0usize;
        for gy in 0..height {
            for gx in 0..width {
                let (u, v) = (gx * step, gy * step);
                let depth = frame.get_pixel(u, v)[0];
                if depth == 0 {
                    points.push(None);
                    continue;
                }
                let camera = intrinsics.unproject(u, v, depth as f32);
                points.push(Some(transform.apply_with(&rotation, camera)));
                valid += 1;
            }
        }

        debug!("Projected {} of {} sampled depth pixels (step {})", valid, width * height, step);

        Self {
            source_width,
            source_height,
            step,
            width,
            height,
            points,
        }
    }

    /// Builds a cloud from precomputed grid points, row-major.
    pub fn from_points(
        source_width: u32,
        source_height: u32,
        step: u32,
        points: Vec<Option<Point3>>,
    ) -> Result<Self> {
        ensure!(step > 0, "Point cloud step must be positive");
        let width = source_width.div_ceil(step);
        let height = source_height.div_ceil(step);
        ensure!(
            points.len() == (width * height) as usize,
            "Expected {} grid points for a {}x{} source at step {}, got {}",
            width * height,
            source_width,
            source_height,
            step,
            points.len()
        );
        Ok(Self {
            source_width,
            source_height,
            step,
            width,
            height,
            points,
        })
    }

    pub fn get(&self, gx: u32, gy: u32) -> Option<Point3> {
        if gx >= self.width || gy >= self.height {
            return None;
        }
        self.points[(gy * self.width + gx) as usize]
    }

    /// Grid dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Dimensions of the depth frame the cloud was sampled from.
    pub fn source_dimensions(&self) -> (u32, u32) {
        (self.source_width, self.source_height)
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn len(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

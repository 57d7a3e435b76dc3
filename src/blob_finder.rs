use anyhow::{ensure, Result};
use image::GrayImage;
use nalgebra::Vector3;
use std::collections::VecDeque;
use tracing::debug;

use crate::point_cloud::{Point3, PointCloud, Resolution, BASE_HEIGHT, BASE_WIDTH};

/// Extraction parameters, all in meters except where noted.
#[derive(Clone, Debug)]
pub struct FinderConfig {
    pub crop_box_min: Point3,
    pub crop_box_max: Point3,
    /// Largest per-axis gap between neighbouring points of one blob.
    pub thresh_3d: Vector3<f32>,
    /// Neighbourhood half-size on the sampling grid, in cells.
    pub thresh_2d: u32,
    /// Cubic meters.
    pub min_volume: f32,
    pub max_volume: f32,
    pub min_points: usize,
    pub max_blobs: usize,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            crop_box_min: Point3::repeat(-10.0),
            crop_box_max: Point3::repeat(10.0),
            thresh_3d: Vector3::new(0.2, 0.2, 0.3),
            thresh_2d: 1,
            min_volume: 0.02,
            max_volume: 2.0,
            min_points: min_points_for(BASE_WIDTH, BASE_HEIGHT, Resolution::default()),
            max_blobs: 10,
        }
    }
}

/// Minimum blob size of one thousandth of the sampled pixels.
pub fn min_points_for(width: u32, height: u32, resolution: Resolution) -> usize {
    let step = resolution.step() as f32;
    (0.001 * (width * height) as f32 / (step * step)) as usize
}

/// A connected cluster of world points found in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Blob {
    /// Mean of all member points.
    pub centroid: Point3,
    pub bbox_min: Point3,
    pub bbox_max: Point3,
    /// Member point with the largest z (the top of the blob in standardized coordinates).
    pub max_z: Point3,
    /// Bounding-box volume in cubic meters.
    pub volume: f32,
    pub points: Vec<Point3>,
}

impl Blob {
    fn from_points(points: Vec<Point3>) -> Self {
        let mut bbox_min = points[0];
        let mut bbox_max = points[0];
        let mut max_z = points[0];
        let mut sum = Point3::zeros();

        for p in &points {
            bbox_min = bbox_min.inf(p);
            bbox_max = bbox_max.sup(p);
            if p.z > max_z.z {
                max_z = *p;
            }
            sum += p;
        }

        let extent = bbox_max - bbox_min;
        Self {
            centroid: sum / points.len() as f32,
            bbox_min,
            bbox_max,
            max_z,
            volume: extent.x * extent.y * extent.z,
            points,
        }
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

fn inside(p: &Point3, min: &Point3, max: &Point3) -> bool {
    (0..3).all(|i| p[i] >= min[i] && p[i] <= max[i])
}

fn within(a: &Point3, b: &Point3, thresh: &Vector3<f32>) -> bool {
    (0..3).all(|i| (a[i] - b[i]).abs() <= thresh[i])
}

/// Finds the blobs of `cloud` under the foreground `mask`.
///
/// Clusters are grown in raster order over the sampling grid. Two candidates
/// are connected when they lie within `thresh_2d` cells of each other on both
/// grid axes and within `thresh_3d` on every world axis. Surviving blobs are
/// ordered by volume, largest first, with ties left in discovery order, and
/// capped at `max_blobs`. The result is deterministic for identical input.
pub fn find_blobs(mask: &GrayImage, cloud: &PointCloud, config: &FinderConfig) -> Result<Vec<Blob>> {
    ensure!(
        mask.dimensions() == cloud.source_dimensions(),
        "Mask is {:?} but the point cloud was sampled from {:?}",
        mask.dimensions(),
        cloud.source_dimensions()
    );

    if config.max_blobs == 0 || config.min_volume > config.max_volume {
        debug!(
            "Degenerate finder config (max_blobs={}, volume {}..{}), no blobs",
            config.max_blobs, config.min_volume, config.max_volume
        );
        return Ok(Vec::new());
    }
    if cloud.is_empty() {
        debug!("Point cloud has no points, no blobs");
        return Ok(Vec::new());
    }

    let (width, height) = cloud.dimensions();
    let step = cloud.step();
    let candidates: Vec<Option<Point3>> = (0..height)
        .flat_map(|gy| (0..width).map(move |gx| (gx, gy)))
        .map(|(gx, gy)| {
            if mask.get_pixel(gx * step, gy * step)[0] == 0 {
                return None;
            }
            cloud
                .get(gx, gy)
                .filter(|p| inside(p, &config.crop_box_min, &config.crop_box_max))
        })
        .collect();

    let mut visited = vec![false; candidates.len()];
    let mut queue = VecDeque::new();
    let mut blobs = Vec::new();
    let mut clusters = 0usize;
    let reach = config.thresh_2d as i64;

    for seed in 0..candidates.len() {
        if visited[seed] || candidates[seed].is_none() {
            continue;
        }
        visited[seed] = true;
        queue.push_back(seed);
        let mut members = Vec::new();

        while let Some(idx) = queue.pop_front() {
            let Some(point) = candidates[idx] else {
                continue;
            };
            members.push(point);

            // window clipped to the grid, whatever thresh_2d says
            let gx = (idx as u32 % width) as i64;
            let gy = (idx as u32 / width) as i64;
            let (rows, cols) = (height as i64, width as i64);
            for ny in (gy - reach).max(0)..=(gy + reach).min(rows - 1) {
                for nx in (gx - reach).max(0)..=(gx + reach).min(cols - 1) {
                    let neighbour = (ny * cols + nx) as usize;
                    if visited[neighbour] {
                        continue;
                    }
                    if let Some(other) = &candidates[neighbour] {
                        if within(&point, other, &config.thresh_3d) {
                            visited[neighbour] = true;
                            queue.push_back(neighbour);
                        }
                    }
                }
            }
        }

        clusters += 1;
        if members.len() < config.min_points {
            continue;
        }
        let blob = Blob::from_points(members);
        if blob.volume >= config.min_volume && blob.volume <= config.max_volume {
            blobs.push(blob);
        }
    }

    // stable sort keeps discovery order among equal volumes
    blobs.sort_by(|a, b| b.volume.total_cmp(&a.volume));
    blobs.truncate(config.max_blobs);

    debug!("Found {} blobs out of {} clusters", blobs.len(), clusters);
    Ok(blobs)
}

//! Organized plane segmentation.
//!
//! [`PlaneSegmenter`] finds planar regions in an organized cloud by region
//! growing over the pixel grid:
//!
//! 1. a local normal is fitted at every valid cell over a
//!    `(2·NORMAL_RADIUS + 1)²` window, skipping window samples across a depth
//!    discontinuity;
//! 2. regions start from cells whose window is mostly populated and absorb
//!    4-connected cells whose normal lies within `angular_threshold` of the
//!    region's plane and whose point lies within `distance_threshold` of it;
//!    the region plane is refitted each time the region doubles;
//! 3. regions with at least `min_inliers` cells are reported with their
//!    least-squares plane.
//!
//! Regions are returned in discovery (raster) order.  Finding nothing is a
//! normal outcome and yields an empty list.

use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use perch_types::OrganizedCloud;
use std::collections::VecDeque;
use tracing::debug;

/// Half-width, in cells, of the normal estimation window.
const NORMAL_RADIUS: usize = 4;

/// Fewest window samples that define a local normal.
const MIN_NORMAL_SUPPORT: usize = 6;

/// First region size at which the region plane is refitted.
const FIRST_REFIT: usize = 8;

/// Tuning for [`PlaneSegmenter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmenterConfig {
    pub min_inliers: usize,
    /// Maximum angle between a cell normal and its region's plane, radians.
    pub angular_threshold: f32,
    /// Maximum distance from a cell to its region's plane, metres.
    pub distance_threshold: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_inliers: 1000,
            angular_threshold: 2.0_f32.to_radians(),
            distance_threshold: 0.02,
        }
    }
}

/// A detected plane.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneModel {
    /// `[a, b, c, d]` with `a·x + b·y + c·z + d = 0`, unit normal, `c ≥ 0`.
    pub coefficients: [f32; 4],
    /// Flat grid indices of the member cells.
    pub indices: Vec<usize>,
}

impl PlaneModel {
    pub fn distance(&self, x: f32, y: f32, z: f32) -> f32 {
        let [a, b, c, d] = self.coefficients;
        (a * x + b * y + c * z + d).abs()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlaneSegmenter {
    config: SegmenterConfig,
}

impl PlaneSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Detect planar regions in `cloud`.
    pub fn segment(&self, cloud: &OrganizedCloud) -> Vec<PlaneModel> {
        let width = cloud.width() as usize;
        let height = cloud.height() as usize;
        // Window samples farther than this from the centre belong to another
        // surface.
        let gate = self.config.distance_threshold * NORMAL_RADIUS as f32;
        let normals = estimate_normals(cloud, gate);
        let seed_support = (2 * NORMAL_RADIUS + 1).pow(2) * 2 / 3;
        let cos_threshold = self.config.angular_threshold.cos();

        let mut visited = vec![false; cloud.len()];
        let mut planes = Vec::new();
        let mut queue = VecDeque::new();

        for seed in 0..cloud.len() {
            let Some(local) = normals[seed] else { continue };
            if visited[seed] || local.support < seed_support {
                continue;
            }
            visited[seed] = true;
            queue.push_back(seed);

            let mut normal = local.normal;
            let mut offset = -normal.dot(&position(cloud, seed));
            let mut moments = Moments::default();
            let mut region = Vec::new();
            let mut next_refit = FIRST_REFIT;

            while let Some(idx) = queue.pop_front() {
                region.push(idx);
                moments.push(position(cloud, idx));
                if region.len() >= next_refit {
                    next_refit *= 2;
                    if let Some((n, d)) = moments.plane() {
                        normal = n.cast::<f32>();
                        offset = d as f32;
                    }
                }

                for next in grid_neighbours(idx, width, height) {
                    if visited[next] {
                        continue;
                    }
                    let Some(candidate) = normals[next] else { continue };
                    let q = position(cloud, next);
                    if candidate.normal.dot(&normal).abs() >= cos_threshold
                        && (normal.dot(&q) + offset).abs() <= self.config.distance_threshold
                    {
                        visited[next] = true;
                        queue.push_back(next);
                    }
                }
            }

            if region.len() >= self.config.min_inliers
                && let Some((n, d)) = moments.plane()
            {
                planes.push(PlaneModel {
                    coefficients: [n.x as f32, n.y as f32, n.z as f32, d as f32],
                    indices: region,
                });
            }
        }

        debug!(planes = planes.len(), "plane segmentation finished");
        planes
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalNormal {
    normal: Vector3<f32>,
    /// Window samples the normal was fitted to.
    support: usize,
}

/// Running first and second moments of a point set.
#[derive(Debug, Clone, Copy)]
struct Moments {
    count: usize,
    sum: Vector3<f64>,
    outer: Matrix3<f64>,
}

impl Default for Moments {
    fn default() -> Self {
        Self {
            count: 0,
            sum: Vector3::zeros(),
            outer: Matrix3::zeros(),
        }
    }
}

impl Moments {
    fn push(&mut self, p: Vector3<f32>) {
        let p = p.cast::<f64>();
        self.count += 1;
        self.sum += p;
        self.outer += p * p.transpose();
    }

    /// Least-squares plane as a unit normal (`z ≥ 0`) and offset.  `None`
    /// for fewer than three points or a collinear set.
    fn plane(&self) -> Option<(Vector3<f64>, f64)> {
        if self.count < 3 {
            return None;
        }
        let n = self.count as f64;
        let centroid = self.sum / n;
        let covariance = self.outer / n - centroid * centroid.transpose();
        let eigen = SymmetricEigen::new(covariance);

        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
        let (middle, largest) = (eigen.eigenvalues[order[1]], eigen.eigenvalues[order[2]]);
        if middle.is_nan() || middle <= 1e-9 * largest {
            return None;
        }

        let mut normal: Vector3<f64> = eigen.eigenvectors.column(order[0]).into_owned();
        let norm = normal.norm();
        if !norm.is_finite() || norm < f64::EPSILON {
            return None;
        }
        normal /= norm;
        if normal.z < 0.0 {
            normal = -normal;
        }
        Some((normal, -normal.dot(&centroid)))
    }
}

fn grid_neighbours(idx: usize, width: usize, height: usize) -> impl Iterator<Item = usize> {
    let (row, col) = (idx / width, idx % width);
    [
        (row > 0).then(|| idx - width),
        (row + 1 < height).then(|| idx + width),
        (col > 0).then(|| idx - 1),
        (col + 1 < width).then(|| idx + 1),
    ]
    .into_iter()
    .flatten()
}

fn position(cloud: &OrganizedCloud, idx: usize) -> Vector3<f32> {
    let p = cloud.points()[idx];
    Vector3::new(p.x, p.y, p.z)
}

fn finite_at(cloud: &OrganizedCloud, idx: usize) -> Option<Vector3<f32>> {
    let p = cloud.points().get(idx)?;
    (p.x.is_finite() && p.y.is_finite() && p.z.is_finite()).then(|| Vector3::new(p.x, p.y, p.z))
}

/// Windowed normal per cell, `None` where the window is too sparse or
/// degenerate.
fn estimate_normals(cloud: &OrganizedCloud, gate: f32) -> Vec<Option<LocalNormal>> {
    let width = cloud.width() as usize;
    let height = cloud.height() as usize;
    (0..cloud.len())
        .map(|idx| {
            let p = finite_at(cloud, idx)?;
            let (row, col) = (idx / width, idx % width);

            let mut moments = Moments::default();
            for r in row.saturating_sub(NORMAL_RADIUS)..=(row + NORMAL_RADIUS).min(height - 1) {
                for c in col.saturating_sub(NORMAL_RADIUS)..=(col + NORMAL_RADIUS).min(width - 1) {
                    if let Some(q) = finite_at(cloud, r * width + c)
                        && (q - p).norm() <= gate
                    {
                        moments.push(q);
                    }
                }
            }
            if moments.count < MIN_NORMAL_SUPPORT {
                return None;
            }
            let (normal, _) = moments.plane()?;
            Some(LocalNormal {
                normal: normal.cast::<f32>(),
                support: moments.count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_types::PointSample;

    const TABLE_Z: f32 = 0.75;

    /// Deterministic uniform noise in `[-amplitude, amplitude]` (xorshift64*).
    struct Jitter(u64);

    impl Jitter {
        fn sample(&mut self, amplitude: f32) -> f32 {
            self.0 ^= self.0 >> 12;
            self.0 ^= self.0 << 25;
            self.0 ^= self.0 >> 27;
            let bits = self.0.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 40;
            (bits as f32 / (1u64 << 24) as f32 * 2.0 - 1.0) * amplitude
        }
    }

    /// 40×40 grid at 1 cm pitch: a flat table with a 12×12 box top raised
    /// 10 cm.
    fn table_with_box() -> OrganizedCloud {
        let mut points = Vec::new();
        for row in 0..40 {
            for col in 0..40 {
                let on_box = (14..26).contains(&row) && (14..26).contains(&col);
                let z = if on_box { TABLE_Z + 0.1 } else { TABLE_Z };
                points.push(PointSample::new(col as f32 * 0.01, row as f32 * 0.01, z));
            }
        }
        OrganizedCloud::new(40, 40, points, true).unwrap()
    }

    fn noisy_table(size: u32, pitch: f32, noise: f32, seed: u64) -> OrganizedCloud {
        let mut jitter = Jitter(seed);
        let mut points = Vec::new();
        for row in 0..size {
            for col in 0..size {
                let z = TABLE_Z + jitter.sample(noise);
                points.push(PointSample::new(col as f32 * pitch, row as f32 * pitch, z));
            }
        }
        OrganizedCloud::new(size, size, points, true).unwrap()
    }

    fn config_with(min_inliers: usize) -> SegmenterConfig {
        SegmenterConfig {
            min_inliers,
            ..SegmenterConfig::default()
        }
    }

    #[test]
    fn finds_table_and_skips_small_box_top() {
        let cloud = table_with_box();
        let planes = PlaneSegmenter::new(config_with(200)).segment(&cloud);
        assert_eq!(planes.len(), 1, "only the table should pass min_inliers");

        let table = &planes[0];
        let [a, b, c, d] = table.coefficients;
        assert!(a.abs() < 1e-3 && b.abs() < 1e-3);
        assert!((c - 1.0).abs() < 1e-3);
        assert!((d + TABLE_Z).abs() < 1e-3);
        assert_eq!(table.indices.len(), 40 * 40 - 12 * 12);

        assert!(!table.indices.contains(&cloud.index(20, 20)));
        assert!(table.indices.contains(&cloud.index(0, 0)));
        // Table cells touching the box edge still belong to the table.
        assert!(table.indices.contains(&cloud.index(13, 20)));
    }

    #[test]
    fn box_top_is_found_when_threshold_allows() {
        let cloud = table_with_box();
        let planes = PlaneSegmenter::new(config_with(4)).segment(&cloud);
        assert_eq!(planes.len(), 2);
        // Raster order: the table is discovered first.
        assert!(planes[0].indices.contains(&0));
        assert_eq!(planes[1].indices.len(), 12 * 12);
        assert!((planes[1].coefficients[3] + TABLE_Z + 0.1).abs() < 1e-3);
    }

    #[test]
    fn noisy_table_is_found_with_default_thresholds() {
        for (pitch, noise) in [(0.002, 0.0002), (0.002, 0.0005), (0.002, 0.001), (0.005, 0.001)] {
            let cloud = noisy_table(60, pitch, noise, 0x9E37_79B9_7F4A_7C15);
            let planes = PlaneSegmenter::default().segment(&cloud);
            assert!(!planes.is_empty(), "pitch {pitch} noise {noise}: no plane");

            let table = &planes[0];
            assert!(
                table.indices.len() > 2000,
                "pitch {pitch} noise {noise}: only {} inliers",
                table.indices.len()
            );
            let [_, _, c, d] = table.coefficients;
            assert!(c > 0.999);
            assert!((d + TABLE_Z).abs() < 2e-3);
        }
    }

    #[test]
    fn empty_scene_yields_no_planes() {
        let cloud = OrganizedCloud::filled(10, 10, PointSample::no_return());
        assert!(PlaneSegmenter::new(config_with(50)).segment(&cloud).is_empty());
    }

    #[test]
    fn strongly_curved_surface_yields_no_planes() {
        // z = 1 + 5·(x² + y²) around the grid centre: the normal turns by
        // more than 2° between neighbouring cells.
        let mut points = Vec::new();
        for row in 0..20 {
            for col in 0..20 {
                let x = (col as f32 - 9.5) * 0.01;
                let y = (row as f32 - 9.5) * 0.01;
                points.push(PointSample::new(x, y, 1.0 + 5.0 * (x * x + y * y)));
            }
        }
        let cloud = OrganizedCloud::new(20, 20, points, true).unwrap();
        assert!(PlaneSegmenter::new(config_with(50)).segment(&cloud).is_empty());
    }

    #[test]
    fn collinear_points_have_no_plane() {
        let mut moments = Moments::default();
        for i in 0..10 {
            moments.push(Vector3::new(i as f32 * 0.01, 0.0, 1.0));
        }
        assert!(moments.plane().is_none());
    }

    #[test]
    fn plane_distance_is_absolute() {
        let plane = PlaneModel {
            coefficients: [0.0, 0.0, 1.0, -1.0],
            indices: vec![],
        };
        assert!((plane.distance(5.0, 5.0, 0.5) - 0.5).abs() < 1e-6);
        assert!((plane.distance(0.0, 0.0, 1.5) - 0.5).abs() < 1e-6);
    }
}

//! Multi-frame depth fusion.
//!
//! [`ObservationAccumulator`] buffers `K` aligned organized clouds and fuses
//! them cell by cell:
//!
//! - the finite depths seen at a cell are collected across all `K` frames;
//! - the fused depth is the order statistic at index `n / 2` of those `n`
//!   values (the true median for odd `n`, the upper of the two middle values
//!   for even `n`; no interpolation);
//! - every other field is copied from the first frame;
//! - a cell with no finite depth in any frame is copied verbatim from the
//!   first frame.
//!
//! With `K = 1` clouds pass straight through.

use perch_types::{OrganizedCloud, PerchError};
use tracing::{debug, warn};

/// What a call to [`ObservationAccumulator::push`] produced.
#[derive(Debug, Clone)]
pub enum Accumulation {
    /// More frames are needed; carries how many are buffered.
    Pending(usize),
    /// `K` frames were fused; the buffer is now empty.
    Fused(OrganizedCloud),
    /// The frame did not match the batch's grid; the batch was dropped and
    /// the offending frame is passed through on its own.
    Fallback {
        cloud: OrganizedCloud,
        error: PerchError,
    },
}

/// Buffers aligned clouds and fuses them by per-cell median depth.
#[derive(Debug)]
pub struct ObservationAccumulator {
    target: usize,
    buffer: Vec<OrganizedCloud>,
}

impl ObservationAccumulator {
    /// `observations` is clamped to at least 1.
    pub fn new(observations: usize) -> Self {
        let target = observations.max(1);
        Self {
            target,
            buffer: Vec::with_capacity(target),
        }
    }

    /// Number of frames fused per batch.
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any partially collected batch.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Add one aligned cloud.
    pub fn push(&mut self, cloud: OrganizedCloud) -> Accumulation {
        if let Some(first) = self.buffer.first()
            && first.dimensions() != cloud.dimensions()
        {
            let error = PerchError::DimensionMismatch {
                expected: first.dimensions(),
                found: cloud.dimensions(),
            };
            warn!(error = %error, dropped = self.buffer.len(), "abandoning fusion batch");
            self.buffer.clear();
            return Accumulation::Fallback { cloud, error };
        }

        if self.target == 1 {
            return Accumulation::Fused(cloud);
        }

        self.buffer.push(cloud);
        debug!(collected = self.buffer.len(), target = self.target, "collected point cloud");
        if self.buffer.len() < self.target {
            return Accumulation::Pending(self.buffer.len());
        }

        let frames = std::mem::take(&mut self.buffer);
        Accumulation::Fused(fuse(&frames))
    }
}

/// Fuse same-shaped clouds; see the module docs for the rule.
///
/// `frames` must be non-empty and share one grid shape.
pub fn fuse(frames: &[OrganizedCloud]) -> OrganizedCloud {
    let Some(first) = frames.first() else {
        return OrganizedCloud::filled(0, 0, perch_types::PointSample::no_return());
    };
    let mut fused = first.clone();
    let mut depths: Vec<f32> = Vec::with_capacity(frames.len());

    for (idx, out) in fused.points_mut().iter_mut().enumerate() {
        depths.clear();
        depths.extend(
            frames
                .iter()
                .filter_map(|f| f.points().get(idx))
                .map(|p| p.z)
                .filter(|z| z.is_finite()),
        );
        if depths.is_empty() {
            continue;
        }
        let middle = depths.len() / 2;
        let (_, median, _) = depths.select_nth_unstable_by(middle, f32::total_cmp);
        out.z = *median;
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_types::PointSample;

    fn cloud_with_depths(depths: &[f32]) -> OrganizedCloud {
        let points = depths
            .iter()
            .enumerate()
            .map(|(i, &z)| PointSample::new(i as f32, 0.5, z).with_color(i as u8, 0, 0))
            .collect();
        OrganizedCloud::new(depths.len() as u32, 1, points, false).unwrap()
    }

    #[test]
    fn single_observation_passes_through() {
        let mut acc = ObservationAccumulator::new(1);
        let cloud = cloud_with_depths(&[1.0, f32::NAN]);
        match acc.push(cloud.clone()) {
            Accumulation::Fused(out) => {
                assert_eq!(out.dimensions(), cloud.dimensions());
                assert_eq!(out.points()[0], cloud.points()[0]);
            }
            other => panic!("expected pass-through, got {other:?}"),
        }
        assert!(acc.is_empty());
    }

    #[test]
    fn zero_observations_is_treated_as_one() {
        assert_eq!(ObservationAccumulator::new(0).target(), 1);
    }

    #[test]
    fn pending_until_k_frames_then_buffer_clears() {
        let mut acc = ObservationAccumulator::new(3);
        assert!(matches!(acc.push(cloud_with_depths(&[1.0])), Accumulation::Pending(1)));
        assert!(matches!(acc.push(cloud_with_depths(&[2.0])), Accumulation::Pending(2)));
        assert!(matches!(acc.push(cloud_with_depths(&[3.0])), Accumulation::Fused(_)));
        assert!(acc.is_empty());
        assert!(matches!(acc.push(cloud_with_depths(&[4.0])), Accumulation::Pending(1)));
    }

    #[test]
    fn odd_count_picks_true_median_and_rejects_outlier() {
        let frames = [
            cloud_with_depths(&[1.00, 2.0]),
            cloud_with_depths(&[9.00, 2.1]),
            cloud_with_depths(&[1.02, 1.9]),
        ];
        let fused = fuse(&frames);
        assert!((fused.points()[0].z - 1.02).abs() < 1e-6);
        assert!((fused.points()[1].z - 2.0).abs() < 1e-6);
    }

    #[test]
    fn even_count_picks_upper_middle_without_interpolating() {
        let frames = [
            cloud_with_depths(&[4.0]),
            cloud_with_depths(&[1.0]),
            cloud_with_depths(&[3.0]),
            cloud_with_depths(&[2.0]),
        ];
        assert_eq!(fuse(&frames).points()[0].z, 3.0);
    }

    #[test]
    fn no_returns_are_ignored_in_median() {
        let frames = [
            cloud_with_depths(&[f32::NAN]),
            cloud_with_depths(&[5.0]),
            cloud_with_depths(&[f32::INFINITY]),
        ];
        assert_eq!(fuse(&frames).points()[0].z, 5.0);
    }

    #[test]
    fn all_invalid_cell_copies_first_frame() {
        let mut first = cloud_with_depths(&[f32::NAN]);
        first.points_mut()[0].x = 42.0;
        let frames = [first.clone(), cloud_with_depths(&[f32::NAN])];
        let fused = fuse(&frames);
        assert_eq!(fused.points()[0].x, 42.0);
        assert!(fused.points()[0].z.is_nan());
    }

    #[test]
    fn other_fields_come_from_first_frame() {
        let first = cloud_with_depths(&[1.0]);
        let mut second = cloud_with_depths(&[3.0]);
        second.points_mut()[0].x = -7.0;
        second.points_mut()[0].r = 200;
        let third = cloud_with_depths(&[2.0]);
        let fused = fuse(&[first.clone(), second, third]);
        assert_eq!(fused.points()[0].x, first.points()[0].x);
        assert_eq!(fused.points()[0].r, first.points()[0].r);
        assert_eq!(fused.is_dense, first.is_dense);
    }

    #[test]
    fn dimension_mismatch_falls_back_to_latest_frame() {
        let mut acc = ObservationAccumulator::new(3);
        acc.push(cloud_with_depths(&[1.0, 1.0]));
        let odd = cloud_with_depths(&[2.0, 2.0, 2.0]);
        match acc.push(odd.clone()) {
            Accumulation::Fallback { cloud, error } => {
                assert_eq!(cloud.dimensions(), odd.dimensions());
                assert!(matches!(error, PerchError::DimensionMismatch { .. }));
            }
            other => panic!("expected fallback, got {other:?}"),
        }
        assert!(acc.is_empty());
    }
}

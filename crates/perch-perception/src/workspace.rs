//! Workspace cropping and support-plane removal.
//!
//! [`WorkspaceFilter`] never changes the grid shape.  Samples outside the
//! inclusive x, then y, then z slab are invalidated in place.  When plane
//! removal is enabled the first plane found by the [`PlaneSegmenter`] is taken
//! to be the support surface and its member cells are invalidated too, so
//! only what rests on the table survives.  Finally every invalid sample is
//! coloured black.

use perch_types::{OrganizedCloud, PointSample, WorkspaceBounds};
use tracing::{debug, info};

use crate::segmentation::{PlaneModel, PlaneSegmenter, SegmenterConfig};

/// Output of [`WorkspaceFilter::filter`].
#[derive(Debug, Clone)]
pub struct FilteredCloud {
    pub cloud: OrganizedCloud,
    /// The removed support plane, if plane removal ran and found one.
    pub support_plane: Option<PlaneModel>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceFilter {
    bounds: WorkspaceBounds,
    segmenter: Option<PlaneSegmenter>,
}

impl WorkspaceFilter {
    /// `plane_removal: None` keeps the slab crop only.
    pub fn new(bounds: WorkspaceBounds, plane_removal: Option<SegmenterConfig>) -> Self {
        Self {
            bounds,
            segmenter: plane_removal.map(PlaneSegmenter::new),
        }
    }

    pub fn bounds(&self) -> &WorkspaceBounds {
        &self.bounds
    }

    pub fn filter(&self, cloud: &OrganizedCloud) -> FilteredCloud {
        let mut out = cloud.clone();
        let b = &self.bounds;
        crop(&mut out, b.x_min, b.x_max, |p| p.x);
        crop(&mut out, b.y_min, b.y_max, |p| p.y);
        crop(&mut out, b.z_min, b.z_max, |p| p.z);
        debug!(valid = out.valid_count(), "workspace crop applied");

        let support_plane = self.segmenter.as_ref().and_then(|segmenter| {
            let plane = segmenter.segment(&out).into_iter().next();
            match &plane {
                Some(plane) => {
                    for &idx in &plane.indices {
                        if let Some(p) = out.points_mut().get_mut(idx) {
                            p.invalidate();
                        }
                    }
                    debug!(
                        inliers = plane.indices.len(),
                        coefficients = ?plane.coefficients,
                        "removed support plane"
                    );
                }
                None => info!("Could not estimate a planar model for the given dataset"),
            }
            plane
        });

        for p in out.points_mut() {
            if !p.is_valid() {
                blacken(p);
            }
        }
        out.refresh_density();

        FilteredCloud {
            cloud: out,
            support_plane,
        }
    }
}

fn crop(cloud: &mut OrganizedCloud, lo: f32, hi: f32, field: impl Fn(&PointSample) -> f32) {
    for p in cloud.points_mut() {
        if !(lo..=hi).contains(&field(p)) {
            p.invalidate();
        }
    }
}

fn blacken(p: &mut PointSample) {
    p.r = 0;
    p.g = 0;
    p.b = 0;
}

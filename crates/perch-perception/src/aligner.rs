//! Frame alignment.
//!
//! [`FrameAligner`] decodes a [`SensorFrame`] and maps every valid sample
//! into the reference frame.  When the sensor → reference transform cannot
//! be found in time the cloud is forwarded untransformed and the lookup error
//! travels with it, so the pipeline stays live.

use std::time::Duration;

use chrono::{DateTime, Utc};
use perch_types::{OrganizedCloud, PerchError, RigidTransform, SensorFrame};
use tracing::{debug, error};

use crate::transform::TransformSource;

/// A decoded frame, in the reference frame unless `transform_error` is set.
#[derive(Debug, Clone)]
pub struct AlignedFrame {
    pub cloud: OrganizedCloud,
    pub stamp: DateTime<Utc>,
    pub transform_error: Option<PerchError>,
}

/// Normalises incoming frames into one reference frame.
#[derive(Debug, Clone)]
pub struct FrameAligner {
    reference_frame: String,
    transform_timeout: Duration,
}

impl FrameAligner {
    pub fn new(reference_frame: impl Into<String>, transform_timeout: Duration) -> Self {
        Self {
            reference_frame: reference_frame.into(),
            transform_timeout,
        }
    }

    pub fn reference_frame(&self) -> &str {
        &self.reference_frame
    }

    /// Decode `frame` and transform it into the reference frame.
    ///
    /// # Errors
    ///
    /// Returns [`PerchError::MalformedCloud`] when the packed buffer cannot be
    /// decoded.  A missing transform is *not* an error; see
    /// [`AlignedFrame::transform_error`].
    pub async fn align(
        &self,
        frame: &SensorFrame,
        transforms: &dyn TransformSource,
    ) -> Result<AlignedFrame, PerchError> {
        let mut packed = frame.cloud.clone();
        packed.normalize_field_counts();
        let mut cloud = packed.decode()?;

        let transform_error = match transforms
            .wait_for_transform(&self.reference_frame, &frame.frame_id, self.transform_timeout)
            .await
        {
            Ok(transform) => {
                apply_transform(&mut cloud, &transform);
                None
            }
            Err(e) => {
                error!(error = %e, frame_id = %frame.frame_id, "forwarding untransformed cloud");
                Some(e)
            }
        };

        debug!(
            width = cloud.width(),
            height = cloud.height(),
            valid = cloud.valid_count(),
            "aligned sensor frame"
        );
        Ok(AlignedFrame {
            cloud,
            stamp: frame.stamp,
            transform_error,
        })
    }
}

/// Transform every fully finite sample in place; invalid samples stay invalid.
pub fn apply_transform(cloud: &mut OrganizedCloud, transform: &RigidTransform) {
    for p in cloud.points_mut() {
        if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
            continue;
        }
        let (x, y, z) = transform.apply(p.x, p.y, p.z);
        p.x = x;
        p.y = y;
        p.z = z;
    }
}

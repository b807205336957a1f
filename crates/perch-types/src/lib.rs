//! `perch-types` – shared data model for the perch perception front-end.
//!
//! # Modules
//!
//! - [`cloud`] – [`OrganizedCloud`] grids of [`PointSample`]s.
//! - [`packed`] – [`PackedCloud`], the packed wire layout of a cloud.
//! - [`pose`] – [`RigidTransform`] and [`Pose`].
//!
//! The crate root holds the request/result records exchanged with the
//! localization backend, the renderable [`ObjectMarker`], the bus [`Event`]
//! envelope and the global [`PerchError`].

pub mod cloud;
pub mod packed;
pub mod pose;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use cloud::{OrganizedCloud, PointSample};
pub use packed::{PackedCloud, PointField};
pub use pose::{Pose, RigidTransform};

// ────────────────────────────────────────────────────────────────────────────
// Workspace
// ────────────────────────────────────────────────────────────────────────────

/// How the z-range of the workspace is derived from the table height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFilterPolicy {
    /// `[table − 0.1, table + 0.55]`, tolerant of calibration drift.
    #[default]
    Widened,
    /// `[table + 0.005, table + 0.5]`.
    Legacy,
}

impl TableFilterPolicy {
    /// `(z_min, z_max)` for a support surface at `table_height`.
    pub fn z_limits(self, table_height: f32) -> (f32, f32) {
        match self {
            TableFilterPolicy::Widened => (table_height - 0.1, table_height + 0.55),
            TableFilterPolicy::Legacy => (table_height + 0.005, table_height + 0.5),
        }
    }
}

/// The retained 3-D region, inclusive on every side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBounds {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
    pub z_min: f32,
    pub z_max: f32,
}

impl WorkspaceBounds {
    /// Bounds over a table: the x/y box plus the z-range `policy` derives
    /// from `table_height`.
    pub fn around_table(
        x_min: f32,
        x_max: f32,
        y_min: f32,
        y_max: f32,
        table_height: f32,
        policy: TableFilterPolicy,
    ) -> Self {
        let (z_min, z_max) = policy.z_limits(table_height);
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
            z_min,
            z_max,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Localization records
// ────────────────────────────────────────────────────────────────────────────

/// One request to the pose-estimation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizationRequest {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
    pub support_surface_height: f32,
    /// Requested objects; order defines the order of the results.
    pub object_ids: Vec<String>,
    /// Camera pose in the reference frame, column-major on the wire.
    pub camera_pose: RigidTransform,
    pub input_organized_cloud: PackedCloud,
}

/// The backend's raw reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizationResponse {
    /// `false` marks an explicit failure response.
    #[serde(default = "default_success")]
    pub success: bool,
    /// One 16-value matrix per requested object, in request order.
    #[serde(default)]
    pub object_transforms: Vec<Vec<f64>>,
    #[serde(default)]
    pub stats_field_names: Vec<String>,
    #[serde(default)]
    pub stats: Vec<f64>,
}

fn default_success() -> bool {
    true
}

/// A decoded object pose.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectLocalization {
    pub object_id: String,
    /// Object frame → reference frame.
    pub transform: RigidTransform,
}

/// The decoded outcome of one successful request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalizationResult {
    pub objects: Vec<ObjectLocalization>,
    pub stats: Vec<(String, f64)>,
}

impl LocalizationResult {
    pub fn poses(&self) -> Vec<Pose> {
        self.objects.iter().map(|o| o.transform.to_pose()).collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Markers
// ────────────────────────────────────────────────────────────────────────────

/// A renderable mesh marker for one localized object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMarker {
    pub namespace: String,
    pub id: u32,
    pub frame_id: String,
    pub object_id: String,
    pub pose: Pose,
    pub scale: [f64; 3],
    /// RGBA in `[0, 1]`.
    pub color: [f32; 4],
    /// `file://` URI of the object's mesh, when the model bank knows it.
    pub mesh_resource: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// A raw depth frame as delivered by the sensor transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorFrame {
    pub stamp: DateTime<Utc>,
    /// Coordinate frame the points are expressed in.
    pub frame_id: String,
    pub cloud: PackedCloud,
}

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"perch-cli::console"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the event bus.
#[derive(Debug, Clone)]
pub enum EventPayload {
    SensorFrame(SensorFrame),
    /// Manual trigger; `'c'` requests a capture.
    Keypress(char),
    /// Request to localize a single named object.
    ObjectRequest(String),
    /// Pose of the first requested object after a successful request.
    ObjectPose(Pose),
    ObjectMarker(ObjectMarker),
    /// Filtered cloud for an external viewer.
    FilteredCloud(OrganizedCloud),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type spanning transform lookups, cloud handling and the
/// backend call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PerchError {
    #[error("Transform from '{source_frame}' to '{target_frame}' unavailable after {waited:?}")]
    TransformUnavailable {
        target_frame: String,
        source_frame: String,
        waited: Duration,
    },

    #[error("Cloud dimension mismatch: expected {expected:?}, found {found:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("Malformed cloud: {0}")]
    MalformedCloud(String),

    #[error("Localization backend failed: {0}")]
    BackendFailed(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

//! Transform Frame (TF) lookup.
//!
//! [`TfEngine`] holds named reference frames and the [`RigidTransform`]s that
//! relate them.  Given two frame names it composes the chain between them via
//! BFS, walking edges in either direction (a child → parent hop uses the
//! inverse of the stored edge).
//!
//! [`TfBuffer`] wraps an engine for concurrent use and lets a caller wait a
//! bounded amount of time for a transform to be published.  Both the frame
//! aligner and the camera-pose lookup go through the [`TransformSource`]
//! trait so tests can swap in a fixed source.
//!
//! # Example
//!
//! ```rust
//! use perch_perception::transform::TfEngine;
//! use perch_types::RigidTransform;
//!
//! let mut tf = TfEngine::new();
//! tf.set_transform("base_footprint", "torso", RigidTransform::from_translation(0.0, 0.0, 1.0));
//! tf.set_transform("torso", "kinect", RigidTransform::from_translation(0.1, 0.0, 0.2));
//!
//! let t = tf.lookup("/base_footprint", "/kinect").unwrap();
//! assert!((t.translation().z - 1.2).abs() < 1e-9);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use perch_types::{PerchError, RigidTransform};
use tokio::sync::Notify;
use tracing::debug;

/// Strip the legacy leading `/` from a frame id.
pub fn normalize_frame_id(frame_id: &str) -> &str {
    frame_id.trim_start_matches('/')
}

// ────────────────────────────────────────────────────────────────────────────
// TfEngine
// ────────────────────────────────────────────────────────────────────────────

/// A graph of named frames.
///
/// `set_transform(parent, child, T)` records the pose of `child` in `parent`:
/// `T` maps points expressed in `child` into `parent`.
#[derive(Debug, Default)]
pub struct TfEngine {
    /// `edges[parent][child] = T_parent_child`
    edges: HashMap<String, HashMap<String, RigidTransform>>,
    /// `parents[child] = parent`
    parents: HashMap<String, String>,
}

impl TfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update the pose of `child_frame` in `parent_frame`.
    pub fn set_transform(&mut self, parent_frame: &str, child_frame: &str, transform: RigidTransform) {
        let parent = normalize_frame_id(parent_frame).to_string();
        let child = normalize_frame_id(child_frame).to_string();
        if let Some(old_parent) = self.parents.insert(child.clone(), parent.clone())
            && old_parent != parent
            && let Some(siblings) = self.edges.get_mut(&old_parent)
        {
            siblings.remove(&child);
            if siblings.is_empty() {
                self.edges.remove(&old_parent);
            }
        }
        self.edges.entry(parent).or_default().insert(child, transform);
    }

    /// Transform mapping points in `source_frame` into `target_frame`.
    ///
    /// Returns `None` if the frames are not connected.
    pub fn lookup(&self, target_frame: &str, source_frame: &str) -> Option<RigidTransform> {
        let target = normalize_frame_id(target_frame);
        let source = normalize_frame_id(source_frame);
        if target == source {
            return Some(RigidTransform::identity());
        }

        // Each queue item carries T_target_current.
        let mut queue: VecDeque<(&str, RigidTransform)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        queue.push_back((target, RigidTransform::identity()));
        visited.insert(target);

        while let Some((current, accumulated)) = queue.pop_front() {
            let children = self
                .edges
                .get(current)
                .into_iter()
                .flat_map(|c| c.iter().map(|(name, t)| (name.as_str(), *t)));
            let parent = self.parents.get(current).and_then(|p| {
                self.edges
                    .get(p)
                    .and_then(|c| c.get(current))
                    .map(|t| (p.as_str(), t.inverse()))
            });

            for (next, hop) in children.chain(parent) {
                if !visited.insert(next) {
                    continue;
                }
                let composed = accumulated.compose(&hop);
                if next == source {
                    return Some(composed);
                }
                queue.push_back((next, composed));
            }
        }

        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TransformSource
// ────────────────────────────────────────────────────────────────────────────

/// Anything that can answer "where is `source_frame` in `target_frame`".
#[async_trait]
pub trait TransformSource: Send + Sync {
    /// Wait at most `timeout` for the transform mapping `source_frame` points
    /// into `target_frame`.
    ///
    /// # Errors
    ///
    /// Returns [`PerchError::TransformUnavailable`] when no transform shows up
    /// in time.
    async fn wait_for_transform(
        &self,
        target_frame: &str,
        source_frame: &str,
        timeout: Duration,
    ) -> Result<RigidTransform, PerchError>;
}

/// A shareable [`TfEngine`] that wakes waiting lookups on every update.
#[derive(Debug, Default)]
pub struct TfBuffer {
    engine: RwLock<TfEngine>,
    updated: Notify,
}

impl TfBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transform(&self, parent_frame: &str, child_frame: &str, transform: RigidTransform) {
        self.engine
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set_transform(parent_frame, child_frame, transform);
        self.updated.notify_waiters();
    }

    /// Non-blocking lookup.
    pub fn lookup(&self, target_frame: &str, source_frame: &str) -> Option<RigidTransform> {
        self.engine
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lookup(target_frame, source_frame)
    }
}

#[async_trait]
impl TransformSource for TfBuffer {
    async fn wait_for_transform(
        &self,
        target_frame: &str,
        source_frame: &str,
        timeout: Duration,
    ) -> Result<RigidTransform, PerchError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so an update between the
            // check and the await is not lost.
            let notified = self.updated.notified();
            if let Some(t) = self.lookup(target_frame, source_frame) {
                return Ok(t);
            }
            debug!(target_frame, source_frame, "waiting for transform");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PerchError::TransformUnavailable {
                    target_frame: target_frame.to_string(),
                    source_frame: source_frame.to_string(),
                    waited: timeout,
                });
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};
    use std::f64::consts::FRAC_PI_2;
    use std::sync::Arc;

    fn offset(x: f64) -> RigidTransform {
        RigidTransform::from_translation(x, 0.0, 0.0)
    }

    #[test]
    fn lookup_same_frame_returns_identity() {
        let tf = TfEngine::new();
        assert_eq!(tf.lookup("world", "/world"), Some(RigidTransform::identity()));
    }

    #[test]
    fn lookup_composed_chain() {
        let mut tf = TfEngine::new();
        tf.set_transform("world", "robot_base", offset(1.0));
        tf.set_transform("robot_base", "camera", offset(0.5));

        let t = tf.lookup("world", "camera").unwrap();
        assert!((t.translation().x - 1.5).abs() < 1e-9);
    }

    #[test]
    fn lookup_walks_edges_backwards_as_inverse() {
        let mut tf = TfEngine::new();
        tf.set_transform("world", "robot_base", offset(1.0));
        tf.set_transform("robot_base", "camera", offset(0.5));

        let t = tf.lookup("camera", "world").unwrap();
        assert!((t.translation().x + 1.5).abs() < 1e-9);
    }

    #[test]
    fn lookup_between_siblings() {
        let mut tf = TfEngine::new();
        tf.set_transform("base", "left", offset(1.0));
        tf.set_transform("base", "right", offset(-1.0));

        let t = tf.lookup("left", "right").unwrap();
        assert!((t.translation().x + 2.0).abs() < 1e-9);
    }

    #[test]
    fn lookup_no_path_returns_none() {
        let mut tf = TfEngine::new();
        tf.set_transform("world", "robot_base", offset(1.0));
        assert!(tf.lookup("world", "ghost_frame").is_none());
    }

    #[test]
    fn reparenting_drops_the_old_edge() {
        let mut tf = TfEngine::new();
        tf.set_transform("world", "gripper", offset(1.0));
        tf.set_transform("table", "mug", offset(0.5));
        tf.set_transform("table", "gripper", offset(2.0));

        assert!(tf.lookup("world", "gripper").is_none());
        assert!(tf.lookup("world", "mug").is_none());
        let t = tf.lookup("mug", "gripper").unwrap();
        assert!((t.translation().x - 1.5).abs() < 1e-9);
    }

    #[test]
    fn lookup_respects_rotation_in_chain() {
        // robot_base is at world origin rotated 90° around Z, camera sits 1 m
        // along robot_base +X, so it ends up at (0, 1, 0) in world.
        let mut tf = TfEngine::new();
        tf.set_transform(
            "world",
            "robot_base",
            RigidTransform::from_parts(
                Vector3::zeros(),
                UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2),
            ),
        );
        tf.set_transform("robot_base", "camera", offset(1.0));

        let t = tf.lookup("world", "camera").unwrap().translation();
        assert!(t.x.abs() < 1e-9, "x={}", t.x);
        assert!((t.y - 1.0).abs() < 1e-9, "y={}", t.y);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_known() {
        let buffer = TfBuffer::new();
        buffer.set_transform("base_footprint", "kinect", offset(0.3));
        let t = buffer
            .wait_for_transform("/base_footprint", "/kinect", Duration::from_millis(10))
            .await
            .unwrap();
        assert!((t.translation().x - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn wait_times_out_when_missing() {
        let buffer = TfBuffer::new();
        let result = buffer
            .wait_for_transform("base_footprint", "kinect", Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(PerchError::TransformUnavailable { .. })));
    }

    #[tokio::test]
    async fn wait_wakes_on_late_publication() {
        let buffer = Arc::new(TfBuffer::new());
        let publisher = Arc::clone(&buffer);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.set_transform("base_footprint", "kinect", offset(2.0));
        });

        let t = buffer
            .wait_for_transform("base_footprint", "kinect", Duration::from_secs(2))
            .await
            .unwrap();
        assert!((t.translation().x - 2.0).abs() < 1e-9);
    }
}

//! Node configuration – reads `~/.perch/config.toml`.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use perch_perception::segmentation::SegmenterConfig;
use perch_runtime::PipelineConfig;
use perch_types::{RigidTransform, TableFilterPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A model-bank entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Mesh file of the object.
    pub file: String,
}

/// A fixed frame edge loaded into the transform buffer at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticTransform {
    pub parent: String,
    pub child: String,
    #[serde(default)]
    pub translation: [f64; 3],
    /// Quaternion `[x, y, z, w]`; normalised on load.
    #[serde(default = "default_rotation")]
    pub rotation: [f64; 4],
}

impl StaticTransform {
    pub fn to_transform(&self) -> RigidTransform {
        let [x, y, z, w] = self.rotation;
        let [tx, ty, tz] = self.translation;
        RigidTransform::from_parts(
            Vector3::new(tx, ty, tz),
            UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
        )
    }
}

/// Region-growing parameters for support-plane removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    #[serde(default = "default_min_inliers")]
    pub min_inliers: usize,
    #[serde(default = "default_angular_threshold_deg")]
    pub angular_threshold_deg: f32,
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            min_inliers: default_min_inliers(),
            angular_threshold_deg: default_angular_threshold_deg(),
            distance_threshold: default_distance_threshold(),
        }
    }
}

/// Startup configuration of the perch node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Publish filtered clouds for an external viewer.
    #[serde(default)]
    pub pcl_visualization: bool,

    /// Support-surface height in the reference frame, metres.
    #[serde(default)]
    pub table_height: f32,

    #[serde(default)]
    pub xmin: f32,
    #[serde(default)]
    pub xmax: f32,
    #[serde(default)]
    pub ymin: f32,
    #[serde(default)]
    pub ymax: f32,

    #[serde(default = "default_reference_frame")]
    pub reference_frame: String,

    #[serde(default = "default_camera_frame")]
    pub camera_frame: String,

    /// Drop frames captured before the latest trigger.
    #[serde(default)]
    pub wait_for_recent_cloud: bool,

    #[serde(default = "default_num_observations")]
    pub num_observations_to_integrate: usize,

    #[serde(default)]
    pub table_filter: TableFilterPolicy,

    #[serde(default = "default_true")]
    pub remove_support_plane: bool,

    #[serde(default)]
    pub segmentation: SegmentationConfig,

    /// Object identifier → model entry.
    #[serde(default)]
    pub model_bank: HashMap<String, ModelEntry>,

    #[serde(default)]
    pub static_transforms: Vec<StaticTransform>,

    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,

    #[serde(default = "default_transform_timeout_secs")]
    pub transform_timeout_secs: u64,

    /// TCP address accepting newline-delimited JSON sensor frames.
    #[serde(default)]
    pub frame_ingest_addr: Option<String>,
}

fn default_reference_frame() -> String {
    "/base_footprint".to_string()
}
fn default_camera_frame() -> String {
    "/head_mount_kinect_rgb_link".to_string()
}
fn default_num_observations() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_rotation() -> [f64; 4] {
    [0.0, 0.0, 0.0, 1.0]
}
fn default_backend_url() -> String {
    "http://localhost:8765".to_string()
}
fn default_backend_timeout_secs() -> u64 {
    30
}
fn default_transform_timeout_secs() -> u64 {
    10
}
fn default_min_inliers() -> usize {
    1000
}
fn default_angular_threshold_deg() -> f32 {
    2.0
}
fn default_distance_threshold() -> f32 {
    0.02
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pcl_visualization: false,
            table_height: 0.0,
            xmin: 0.0,
            xmax: 0.0,
            ymin: 0.0,
            ymax: 0.0,
            reference_frame: default_reference_frame(),
            camera_frame: default_camera_frame(),
            wait_for_recent_cloud: false,
            num_observations_to_integrate: default_num_observations(),
            table_filter: TableFilterPolicy::default(),
            remove_support_plane: true,
            segmentation: SegmentationConfig::default(),
            model_bank: HashMap::new(),
            static_transforms: Vec::new(),
            backend_url: default_backend_url(),
            backend_timeout_secs: default_backend_timeout_secs(),
            transform_timeout_secs: default_transform_timeout_secs(),
            frame_ingest_addr: None,
        }
    }
}

impl Config {
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let plane_removal = self.remove_support_plane.then(|| SegmenterConfig {
            min_inliers: self.segmentation.min_inliers,
            angular_threshold: self.segmentation.angular_threshold_deg.to_radians(),
            distance_threshold: self.segmentation.distance_threshold,
        });
        PipelineConfig {
            reference_frame: self.reference_frame.clone(),
            camera_frame: self.camera_frame.clone(),
            x_min: self.xmin,
            x_max: self.xmax,
            y_min: self.ymin,
            y_max: self.ymax,
            table_height: self.table_height,
            table_filter: self.table_filter,
            wait_for_recent: self.wait_for_recent_cloud,
            observations: self.num_observations_to_integrate,
            visualization: self.pcl_visualization,
            plane_removal,
            model_bank: self
                .model_bank
                .iter()
                .map(|(id, entry)| (id.clone(), entry.file.clone()))
                .collect(),
            transform_timeout: Duration::from_secs(self.transform_timeout_secs),
            backend_timeout: Duration::from_secs(self.backend_timeout_secs),
        }
    }
}

/// Return the path to `~/.perch/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".perch").join("config.toml")
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `PERCH_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PERCH_BACKEND_URL` | `backend_url` |
/// | `PERCH_TABLE_HEIGHT` | `table_height` |
/// | `PERCH_NUM_OBSERVATIONS` | `num_observations_to_integrate` |
/// | `PERCH_WAIT_FOR_RECENT` | `wait_for_recent_cloud` |
/// | `PERCH_FRAME_INGEST` | `frame_ingest_addr` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("PERCH_BACKEND_URL") {
        cfg.backend_url = v;
    }
    if let Ok(v) = std::env::var("PERCH_TABLE_HEIGHT")
        && let Ok(h) = v.parse::<f32>()
    {
        cfg.table_height = h;
    }
    if let Ok(v) = std::env::var("PERCH_NUM_OBSERVATIONS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.num_observations_to_integrate = n;
    }
    if let Ok(v) = std::env::var("PERCH_WAIT_FOR_RECENT")
        && let Ok(b) = v.parse::<bool>()
    {
        cfg.wait_for_recent_cloud = b;
    }
    if let Ok(v) = std::env::var("PERCH_FRAME_INGEST") {
        cfg.frame_ingest_addr = Some(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    #[test]
    fn config_path_points_to_perch_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".perch"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn empty_file_yields_defaults() {
        let (_dir, path) = write_config("");
        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.reference_frame, "/base_footprint");
        assert_eq!(cfg.camera_frame, "/head_mount_kinect_rgb_link");
        assert_eq!(cfg.table_filter, TableFilterPolicy::Widened);
        assert!(cfg.remove_support_plane);
        assert_eq!(cfg.segmentation, SegmentationConfig::default());
        assert!(cfg.frame_ingest_addr.is_none());
    }

    #[test]
    fn full_file_is_parsed() {
        let (_dir, path) = write_config(
            r#"
            pcl_visualization = true
            table_height = 0.72
            xmin = 0.3
            xmax = 1.1
            ymin = -0.5
            ymax = 0.5
            reference_frame = "/odom"
            num_observations_to_integrate = 5
            table_filter = "legacy"
            remove_support_plane = false
            frame_ingest_addr = "0.0.0.0:7878"

            [segmentation]
            min_inliers = 500

            [model_bank.cup]
            file = "/models/cup.stl"
            "#,
        );
        let cfg = load_from(&path).expect("load ok").expect("some");
        assert!(cfg.pcl_visualization);
        assert_eq!(cfg.table_filter, TableFilterPolicy::Legacy);
        assert_eq!(cfg.segmentation.min_inliers, 500);
        assert!((cfg.segmentation.distance_threshold - 0.02).abs() < 1e-6);
        assert_eq!(cfg.model_bank["cup"].file, "/models/cup.stl");
        assert_eq!(cfg.frame_ingest_addr.as_deref(), Some("0.0.0.0:7878"));

        let pipeline = cfg.to_pipeline_config();
        assert!(pipeline.plane_removal.is_none());
        assert_eq!(pipeline.model_bank["cup"], "/models/cup.stl");
        let bounds = pipeline.bounds();
        assert!((bounds.z_min - (cfg.table_height + 0.005)).abs() < 1e-5);
        assert!((bounds.y_min + 0.5).abs() < 1e-6);
    }

    #[test]
    fn static_transforms_are_parsed_and_normalised() {
        let (_dir, path) = write_config(
            r#"
            [[static_transforms]]
            parent = "/base_footprint"
            child = "head_mount_kinect_rgb_link"
            translation = [0.1, 0.0, 1.5]

            [[static_transforms]]
            parent = "head_mount_kinect_rgb_link"
            child = "kinect"
            rotation = [0.0, 0.0, 2.0, 2.0]
            "#,
        );
        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.static_transforms.len(), 2);

        let lift = cfg.static_transforms[0].to_transform();
        let (x, y, z) = lift.apply(0.0, 0.0, 0.0);
        assert!((x - 0.1).abs() < 1e-5 && y.abs() < 1e-5 && (z - 1.5).abs() < 1e-5);

        // 90° about z once normalised.
        let turn = cfg.static_transforms[1].to_transform();
        let (x, y, _) = turn.apply(1.0, 0.0, 0.0);
        assert!(x.abs() < 1e-5 && (y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let (_dir, path) = write_config("table_height = \"high\"");
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn segmentation_angle_converts_to_radians() {
        let pipeline = Config::default().to_pipeline_config();
        let seg = pipeline.plane_removal.expect("enabled by default");
        assert!((seg.angular_threshold - 2.0_f32.to_radians()).abs() < 1e-6);
        assert_eq!(pipeline.backend_timeout, Duration::from_secs(30));
    }

    #[test]
    fn apply_env_overrides_changes_backend_url() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("PERCH_BACKEND_URL", "http://perception-host:9000") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.backend_url, "http://perception-host:9000");
        unsafe { std::env::remove_var("PERCH_BACKEND_URL") };
    }

    #[test]
    fn apply_env_overrides_changes_table_height() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("PERCH_TABLE_HEIGHT", "0.8") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!((cfg.table_height - 0.8).abs() < 1e-6);
        unsafe { std::env::remove_var("PERCH_TABLE_HEIGHT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_observation_count() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("PERCH_NUM_OBSERVATIONS", "many") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.num_observations_to_integrate, 1);
        unsafe { std::env::remove_var("PERCH_NUM_OBSERVATIONS") };
    }

    #[test]
    fn apply_env_overrides_changes_wait_for_recent() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("PERCH_WAIT_FOR_RECENT", "true") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!(cfg.wait_for_recent_cloud);
        unsafe { std::env::remove_var("PERCH_WAIT_FOR_RECENT") };
    }
}

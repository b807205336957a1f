//! Mesh markers for localized objects.

use std::collections::HashMap;

use perch_types::{LocalizationResult, ObjectMarker};
use tracing::warn;

pub const MARKER_NAMESPACE: &str = "perch";

const MARKER_ALPHA: f32 = 0.8;

/// 26 visually distinct colours, indexed by request position.
const PALETTE: [[u8; 3]; 26] = [
    [240, 163, 255],
    [0, 117, 220],
    [153, 63, 0],
    [76, 0, 92],
    [25, 25, 25],
    [0, 92, 49],
    [43, 206, 72],
    [255, 204, 153],
    [128, 128, 128],
    [148, 255, 181],
    [143, 124, 0],
    [157, 204, 0],
    [194, 0, 136],
    [0, 51, 128],
    [255, 164, 5],
    [255, 168, 187],
    [66, 102, 0],
    [255, 0, 16],
    [94, 241, 242],
    [0, 153, 143],
    [224, 255, 102],
    [116, 10, 255],
    [153, 0, 0],
    [255, 255, 128],
    [255, 255, 0],
    [255, 80, 5],
];

/// RGBA colour for the object at request position `index`.
pub fn palette_color(index: usize) -> [f32; 4] {
    let [r, g, b] = PALETTE[index % PALETTE.len()];
    [
        f32::from(r) / 255.0,
        f32::from(g) / 255.0,
        f32::from(b) / 255.0,
        MARKER_ALPHA,
    ]
}

/// One marker per localized object, in request order.
///
/// `model_bank` maps object identifiers to mesh file paths; objects without
/// an entry get a marker with no mesh.
pub fn build_markers(
    result: &LocalizationResult,
    frame_id: &str,
    model_bank: &HashMap<String, String>,
) -> Vec<ObjectMarker> {
    result
        .objects
        .iter()
        .enumerate()
        .map(|(index, object)| {
            let mesh_resource = model_bank.get(&object.object_id).map(|file| format!("file://{file}"));
            if mesh_resource.is_none() {
                warn!(object_id = %object.object_id, "no model file registered for object");
            }
            ObjectMarker {
                namespace: MARKER_NAMESPACE.to_string(),
                id: index as u32,
                frame_id: frame_id.to_string(),
                object_id: object.object_id.clone(),
                pose: object.transform.to_pose(),
                scale: [1.0; 3],
                color: palette_color(index),
                mesh_resource,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_types::{ObjectLocalization, RigidTransform};

    fn result(names: &[&str]) -> LocalizationResult {
        LocalizationResult {
            objects: names
                .iter()
                .enumerate()
                .map(|(i, name)| ObjectLocalization {
                    object_id: name.to_string(),
                    transform: RigidTransform::from_translation(i as f64, 0.0, 0.0),
                })
                .collect(),
            stats: vec![],
        }
    }

    #[test]
    fn markers_follow_request_order_with_mesh_uris() {
        let bank = HashMap::from([("cup".to_string(), "/models/cup.stl".to_string())]);
        let markers = build_markers(&result(&["cup", "bowl"]), "base_footprint", &bank);

        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].id, 0);
        assert_eq!(markers[0].namespace, MARKER_NAMESPACE);
        assert_eq!(markers[0].mesh_resource.as_deref(), Some("file:///models/cup.stl"));
        assert_eq!(markers[1].object_id, "bowl");
        assert!(markers[1].mesh_resource.is_none());
        assert!((markers[1].pose.position[0] - 1.0).abs() < 1e-9);
        assert_eq!(markers[1].frame_id, "base_footprint");
    }

    #[test]
    fn palette_wraps_and_uses_fixed_alpha() {
        assert_eq!(palette_color(0), palette_color(26));
        let [r, g, b, a] = palette_color(1);
        assert!(r.abs() < 1e-6);
        assert!((g - 117.0 / 255.0).abs() < 1e-6);
        assert!((b - 220.0 / 255.0).abs() < 1e-6);
        assert!((a - 0.8).abs() < 1e-6);
    }
}

//! Rigid transforms and poses.
//!
//! A [`RigidTransform`] is a 4×4 homogeneous matrix (rotation + translation).
//! On the wire it is flattened to 16 values in **column-major** order; decoding
//! reads the values row by row and transposes the result, which is the same as
//! a column-major read.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::PerchError;

/// A 4×4 homogeneous rigid-body transform.
///
/// `RigidTransform` values are immutable once built: every operation returns
/// a new transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct RigidTransform {
    matrix: Matrix4<f64>,
}

impl RigidTransform {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    /// Wrap an existing homogeneous matrix.
    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self { matrix }
    }

    /// Build a transform from a translation and a rotation.
    pub fn from_parts(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        let mut matrix = rotation.to_homogeneous();
        matrix[(0, 3)] = translation.x;
        matrix[(1, 3)] = translation.y;
        matrix[(2, 3)] = translation.z;
        Self { matrix }
    }

    /// Pure translation.
    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self::from_parts(Vector3::new(x, y, z), UnitQuaternion::identity())
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.matrix[(0, 3)], self.matrix[(1, 3)], self.matrix[(2, 3)])
    }

    /// Rotation part as a unit quaternion.
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        let r: Matrix3<f64> = self.matrix.fixed_view::<3, 3>(0, 0).into_owned();
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r))
    }

    /// Compose two transforms: `self` applied after `other`.
    ///
    /// If `self` = T_A_B and `other` = T_B_C, the result is T_A_C.
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            matrix: self.matrix * other.matrix,
        }
    }

    /// Inverse of a rigid transform (transposed rotation, rotated negated
    /// translation).
    pub fn inverse(&self) -> Self {
        let r: Matrix3<f64> = self.matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let rt = r.transpose();
        let t = -(rt * self.translation());
        let mut matrix = Matrix4::identity();
        matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(&rt);
        matrix[(0, 3)] = t.x;
        matrix[(1, 3)] = t.y;
        matrix[(2, 3)] = t.z;
        Self { matrix }
    }

    /// Map a single point through the transform.
    pub fn apply(&self, x: f32, y: f32, z: f32) -> (f32, f32, f32) {
        let m = &self.matrix;
        let (x, y, z) = (f64::from(x), f64::from(y), f64::from(z));
        (
            (m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)] * z + m[(0, 3)]) as f32,
            (m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)] * z + m[(1, 3)]) as f32,
            (m[(2, 0)] * x + m[(2, 1)] * y + m[(2, 2)] * z + m[(2, 3)]) as f32,
        )
    }

    /// Flatten into 16 values, column-major.
    pub fn to_column_major(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        out.copy_from_slice(self.matrix.as_slice());
        out
    }

    /// Decode a 16-value wire matrix.
    ///
    /// The values are read as rows and then transposed.
    ///
    /// # Errors
    ///
    /// Returns [`PerchError::MalformedCloud`] when `data` does not hold exactly
    /// 16 values.
    pub fn from_wire(data: &[f64]) -> Result<Self, PerchError> {
        if data.len() != 16 {
            return Err(PerchError::MalformedCloud(format!(
                "expected 16 transform values, got {}",
                data.len()
            )));
        }
        Ok(Self {
            matrix: Matrix4::from_row_slice(data).transpose(),
        })
    }

    /// Position + orientation view of this transform.
    pub fn to_pose(&self) -> Pose {
        let t = self.translation();
        let q = self.rotation();
        Pose {
            position: [t.x, t.y, t.z],
            orientation: [q.i, q.j, q.k, q.w],
        }
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl From<RigidTransform> for Vec<f64> {
    fn from(t: RigidTransform) -> Self {
        t.to_column_major().to_vec()
    }
}

impl TryFrom<Vec<f64>> for RigidTransform {
    type Error = PerchError;

    fn try_from(data: Vec<f64>) -> Result<Self, Self::Error> {
        Self::from_wire(&data)
    }
}

/// Position + orientation, orientation as a quaternion `[x, y, z, w]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f64; 3],
    pub orientation: [f64; 4],
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            orientation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

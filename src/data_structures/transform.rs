//! Local transformation data and the matrices derived from it.
//!
//! Every scene node carries a [`TransformNode`]. Its model matrix is the
//! local TRS composed with the parent's *scale-stripped* model matrix, so a
//! parent's scale never leaks into its children.

use cgmath::{InnerSpace, Matrix4, One, Quaternion, Rad, Rotation3, SquareMatrix, Vector3};

/// Position, orientation (unit quaternion) and scale of a node relative to its
/// parent, together with the matrices computed from them during the last
/// scene update.
#[derive(Clone, Debug)]
pub struct TransformNode {
    pub(crate) position: Vector3<f32>,
    pub(crate) orientation: Quaternion<f32>,
    pub(crate) scale: Vector3<f32>,
    pub(crate) model: Matrix4<f32>,
    pub(crate) previous_model: Matrix4<f32>,
    pub(crate) model_without_scale: Matrix4<f32>,
}

impl TransformNode {
    /// Identity transformation (no move, rotate, or scale).
    pub fn new() -> Self {
        Self {
            position: Vector3::new(0.0, 0.0, 0.0),
            // `Quaternion::one()` is the identity quaternion (no rotation)
            orientation: Quaternion::one(),
            scale: Vector3::new(1.0, 1.0, 1.0),
            model: Matrix4::identity(),
            previous_model: Matrix4::identity(),
            model_without_scale: Matrix4::identity(),
        }
    }

    pub fn position(&self) -> Vector3<f32> {
        self.position
    }

    pub fn orientation(&self) -> Quaternion<f32> {
        self.orientation
    }

    pub fn scale(&self) -> Vector3<f32> {
        self.scale
    }

    /// World matrix as of the last update.
    pub fn model_matrix(&self) -> Matrix4<f32> {
        self.model
    }

    /// World matrix of the update before the last one, used for motion vectors.
    pub fn previous_model_matrix(&self) -> Matrix4<f32> {
        self.previous_model
    }

    /// World matrix without this node's (or any ancestor's) scale.
    pub fn model_matrix_without_scale(&self) -> Matrix4<f32> {
        self.model_without_scale
    }

    /// `T * R`, the part of the local transform that children inherit.
    pub fn local_rigid_matrix(&self) -> Matrix4<f32> {
        Matrix4::from_translation(self.position) * Matrix4::from(self.orientation)
    }

    /// `T * R * S`
    pub fn local_matrix(&self) -> Matrix4<f32> {
        self.local_rigid_matrix()
            * Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z)
    }

    pub(crate) fn set_position(&mut self, position: Vector3<f32>) {
        self.position = position;
    }

    pub(crate) fn set_orientation(&mut self, orientation: Quaternion<f32>) {
        // a zero quaternion cannot be normalized; treat it as "no rotation"
        self.orientation = if orientation.magnitude2() > f32::EPSILON {
            orientation.normalize()
        } else {
            Quaternion::one()
        };
    }

    pub(crate) fn set_scale(&mut self, scale: Vector3<f32>) {
        self.scale = scale;
    }

    pub(crate) fn move_by(&mut self, offset: Vector3<f32>) {
        self.position += offset;
    }

    /// Rotates around an axis given in the node's local frame.
    pub(crate) fn rotate(&mut self, axis: Vector3<f32>, angle: Rad<f32>) {
        if axis.magnitude2() <= f32::EPSILON {
            return;
        }
        let delta = Quaternion::from_axis_angle(axis.normalize(), angle);
        self.set_orientation(self.orientation * delta);
    }

    /// Snapshots the current model matrix as the previous one.
    pub(crate) fn snapshot(&mut self) {
        self.previous_model = self.model;
    }

    /// Recomputes the world matrices from the local TRS and the parent's
    /// scale-stripped world matrix.
    pub(crate) fn recompute(&mut self, parent_without_scale: &Matrix4<f32>) {
        self.model_without_scale = parent_without_scale * self.local_rigid_matrix();
        self.model = parent_without_scale * self.local_matrix();
    }
}

impl Default for TransformNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Packs the upper 3x4 part of a column-major matrix into rows, the layout
/// instance records use on the GPU.
pub fn to_rows_3x4(matrix: &Matrix4<f32>) -> [[f32; 4]; 3] {
    let m: [[f32; 4]; 4] = (*matrix).into();
    [
        [m[0][0], m[1][0], m[2][0], m[3][0]],
        [m[0][1], m[1][1], m[2][1], m[3][1]],
        [m[0][2], m[1][2], m[2][2], m[3][2]],
    ]
}

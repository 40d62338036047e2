use cgmath::{Matrix4, Point3, Rad, SquareMatrix};

use crate::{
    data_structures::scene_graph::{NodeBehavior, NodeContext},
    render_state::{CameraView, RenderState},
};

/// Perspective camera. The view and projection matrices are recomputed on
/// every update, whether or not the node moved, because the viewport can
/// change independently of the scene.
#[derive(Clone, Debug)]
pub struct CameraNode {
    pub fov_y: Rad<f32>,
    pub near: f32,
    pub far: f32,
    aspect: f32,
    view: Matrix4<f32>,
    projection: Matrix4<f32>,
}

impl CameraNode {
    pub fn new(fov_y: impl Into<Rad<f32>>, near: f32, far: f32) -> Self {
        Self {
            fov_y: fov_y.into(),
            near,
            far,
            aspect: 1.0,
            view: Matrix4::identity(),
            projection: Matrix4::identity(),
        }
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    pub fn view(&self) -> Matrix4<f32> {
        self.view
    }

    pub fn projection(&self) -> Matrix4<f32> {
        self.projection
    }
}

impl NodeBehavior for CameraNode {
    fn update(&mut self, node: NodeContext<'_>, state: &mut RenderState) {
        let (width, height) = state.extent();
        self.aspect = width.max(1) as f32 / height.max(1) as f32;
        let rigid = node.transform.model_matrix_without_scale();
        // rigid transforms are always invertible, fall back for degenerate input
        self.view = rigid.invert().unwrap_or_else(Matrix4::identity);
        self.projection = cgmath::perspective(self.fov_y, self.aspect, self.near, self.far);

        state.offer_camera(CameraView {
            node: node.id,
            view: self.view,
            projection: self.projection,
            position: Point3::new(rigid.w.x, rigid.w.y, rigid.w.z),
            fov_y: self.fov_y,
            near: self.near,
            far: self.far,
        });
    }
}

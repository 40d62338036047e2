//! Light node variants and their GPU representation.
//!
//! Lights take their position and direction from the node transform: the
//! light shines along the node's local -Z axis.

use std::sync::Arc;

use cgmath::{Deg, InnerSpace, Matrix4, Point3, Rad, Vector3, Vector4};

use crate::{
    data_structures::{
        mesh::Texture,
        scene_graph::{NodeBehavior, NodeContext},
    },
    render_state::{IblView, LightKind, LightView, RenderState},
};

#[derive(Clone, Debug)]
pub struct DirectionalLightNode {
    pub color: [f32; 3],
    pub intensity: f32,
}

#[derive(Clone, Debug)]
pub struct SpotLightNode {
    pub color: [f32; 3],
    pub intensity: f32,
    pub range: f32,
    pub inner_angle: Rad<f32>,
    pub outer_angle: Rad<f32>,
}

#[derive(Clone, Debug)]
pub struct PointLightNode {
    pub color: [f32; 3],
    pub intensity: f32,
    pub range: f32,
}

/// Image-based lighting from an environment texture.
#[derive(Clone, Debug)]
pub struct IblNode {
    pub environment: Arc<Texture>,
    pub intensity: f32,
}

impl Default for DirectionalLightNode {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0],
            intensity: 1.0,
        }
    }
}

impl Default for SpotLightNode {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0],
            intensity: 10.0,
            range: 20.0,
            inner_angle: Deg(20.0).into(),
            outer_angle: Deg(30.0).into(),
        }
    }
}

impl Default for PointLightNode {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0],
            intensity: 10.0,
            range: 20.0,
        }
    }
}

fn position_and_direction(matrix: &Matrix4<f32>) -> (Point3<f32>, Vector3<f32>) {
    let forward = (matrix * Vector4::new(0.0, 0.0, -1.0, 0.0)).truncate();
    let direction = if forward.magnitude2() > f32::EPSILON {
        forward.normalize()
    } else {
        Vector3::new(0.0, 0.0, -1.0)
    };
    (Point3::new(matrix.w.x, matrix.w.y, matrix.w.z), direction)
}

fn light_view(
    node: &NodeContext<'_>,
    kind: LightKind,
    color: [f32; 3],
    intensity: f32,
    range: f32,
    inner_angle: Rad<f32>,
    outer_angle: Rad<f32>,
) -> LightView {
    let (position, direction) = position_and_direction(&node.transform.model_matrix_without_scale());
    LightView {
        node: node.id,
        kind,
        position,
        direction,
        color,
        intensity,
        range,
        inner_angle,
        outer_angle,
    }
}

impl NodeBehavior for DirectionalLightNode {
    fn update(&mut self, node: NodeContext<'_>, state: &mut RenderState) {
        state.push_light(light_view(
            &node,
            LightKind::Directional,
            self.color,
            self.intensity,
            f32::INFINITY,
            Rad(0.0),
            Rad(0.0),
        ));
    }
}

impl NodeBehavior for SpotLightNode {
    fn update(&mut self, node: NodeContext<'_>, state: &mut RenderState) {
        state.push_light(light_view(
            &node,
            LightKind::Spot,
            self.color,
            self.intensity,
            self.range,
            self.inner_angle,
            self.outer_angle,
        ));
    }
}

impl NodeBehavior for PointLightNode {
    fn update(&mut self, node: NodeContext<'_>, state: &mut RenderState) {
        state.push_light(light_view(
            &node,
            LightKind::Point,
            self.color,
            self.intensity,
            self.range,
            Rad(0.0),
            Rad(0.0),
        ));
    }
}

impl NodeBehavior for IblNode {
    fn update(&mut self, node: NodeContext<'_>, state: &mut RenderState) {
        if state.ibl.is_some() {
            log::warn!(
                "More than one image-based light is enabled, ignoring {}",
                node.name
            );
            return;
        }
        state.ibl = Some(IblView {
            node: node.id,
            environment: self.environment.id,
            intensity: self.intensity,
            rotation: Matrix4::from(node.transform.orientation()),
        });
    }
}

/**
 * The raw light is the record stored in the per-frame light buffer.
 */
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightRaw {
    pub position: [f32; 3],
    pub kind: u32,
    pub direction: [f32; 3],
    pub range: f32,
    pub color: [f32; 3],
    pub intensity: f32,
    pub cos_inner: f32,
    pub cos_outer: f32,
    // Storage buffers require 16 byte alignment of the element stride
    pub _padding: [f32; 2],
}

impl LightView {
    pub fn to_raw(&self) -> LightRaw {
        LightRaw {
            position: self.position.into(),
            kind: self.kind.shader_id(),
            direction: self.direction.into(),
            // WGSL has no infinity literal, directional lights use a huge range instead
            range: if self.range.is_finite() { self.range } else { f32::MAX },
            color: self.color,
            intensity: self.intensity,
            cos_inner: self.inner_angle.0.cos(),
            cos_outer: self.outer_angle.0.cos(),
            _padding: [0.0; 2],
        }
    }
}

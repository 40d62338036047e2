//! Per-frame snapshot of everything the GPU stages need from the scene.
//!
//! A [`RenderState`] is created once and reused: [`RenderState::begin_frame`]
//! clears and re-stamps it, the scene traversal fills it, the acceleration
//! structure and integrator stages read it, and [`RenderState::end_frame`]
//! drops every view again. Nothing in here owns scene data; the views are
//! copies of the values gathered during traversal, tagged with the node they
//! came from.

use cgmath::{Matrix4, Point3, Rad, Vector3};

use crate::{
    data_structures::{
        mesh::{Aabb, MaterialId, MeshId, TextureId},
        scene_graph::NodeId,
    },
    gpu::{AccelerationStructureHandle, CommandBufferHandle},
    scene::SceneState,
};

/// One mesh instance that goes into the top-level acceleration structure.
#[derive(Clone, Debug)]
pub struct MeshInstance {
    pub node: NodeId,
    pub mesh: MeshId,
    pub material: Option<MaterialId>,
    /// Per-instance index data, forwarded to the shaders as custom index.
    pub custom_index: u32,
    /// Object-space bounds of the mesh.
    pub bounds: Aabb,
    pub model: Matrix4<f32>,
    pub previous_model: Matrix4<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LightKind {
    Directional,
    Spot,
    Point,
}

impl LightKind {
    pub fn shader_id(self) -> u32 {
        match self {
            LightKind::Directional => 0,
            LightKind::Spot => 1,
            LightKind::Point => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LightView {
    pub node: NodeId,
    pub kind: LightKind,
    pub position: Point3<f32>,
    pub direction: Vector3<f32>,
    pub color: [f32; 3],
    pub intensity: f32,
    pub range: f32,
    pub inner_angle: Rad<f32>,
    pub outer_angle: Rad<f32>,
}

#[derive(Clone, Debug)]
pub struct CameraView {
    pub node: NodeId,
    pub view: Matrix4<f32>,
    pub projection: Matrix4<f32>,
    pub position: Point3<f32>,
    pub fov_y: Rad<f32>,
    pub near: f32,
    pub far: f32,
}

#[derive(Clone, Debug)]
pub struct IblView {
    pub node: NodeId,
    pub environment: TextureId,
    pub intensity: f32,
    pub rotation: Matrix4<f32>,
}

#[derive(Debug)]
pub struct RenderState {
    frame_index: u64,
    frame_slot: usize,
    extent: (u32, u32),
    pub(crate) scene_state: SceneState,
    pub(crate) preferred_camera: Option<NodeId>,
    pub(crate) meshes: Vec<MeshInstance>,
    pub(crate) directional_lights: Vec<LightView>,
    pub(crate) spot_lights: Vec<LightView>,
    pub(crate) point_lights: Vec<LightView>,
    pub(crate) camera: Option<CameraView>,
    fallback_camera: Option<CameraView>,
    pub(crate) ibl: Option<IblView>,
    command_buffer: Option<CommandBufferHandle>,
    pub(crate) acceleration_structure: Option<AccelerationStructureHandle>,
}

impl RenderState {
    pub fn new(extent: (u32, u32)) -> Self {
        Self {
            frame_index: 0,
            frame_slot: 0,
            extent,
            scene_state: SceneState::Ready,
            preferred_camera: None,
            meshes: Vec::new(),
            directional_lights: Vec::new(),
            spot_lights: Vec::new(),
            point_lights: Vec::new(),
            camera: None,
            fallback_camera: None,
            ibl: None,
            command_buffer: None,
            acceleration_structure: None,
        }
    }

    /// Clears the previous frame's views and stamps the new frame.
    pub fn begin_frame(
        &mut self,
        frame_index: u64,
        frame_slot: usize,
        extent: (u32, u32),
        command_buffer: Option<CommandBufferHandle>,
    ) {
        self.clear();
        self.frame_index = frame_index;
        self.frame_slot = frame_slot;
        self.extent = extent;
        self.command_buffer = command_buffer;
    }

    /// Invalidates every view gathered for the frame that just ended.
    pub fn end_frame(&mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        self.scene_state = SceneState::Ready;
        self.preferred_camera = None;
        self.meshes.clear();
        self.directional_lights.clear();
        self.spot_lights.clear();
        self.point_lights.clear();
        self.camera = None;
        self.fallback_camera = None;
        self.ibl = None;
        self.command_buffer = None;
        self.acceleration_structure = None;
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Index of the frame-in-flight slot whose per-frame data may be written.
    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn scene_state(&self) -> SceneState {
        self.scene_state
    }

    pub fn meshes(&self) -> &[MeshInstance] {
        &self.meshes
    }

    pub fn directional_lights(&self) -> &[LightView] {
        &self.directional_lights
    }

    pub fn spot_lights(&self) -> &[LightView] {
        &self.spot_lights
    }

    pub fn point_lights(&self) -> &[LightView] {
        &self.point_lights
    }

    /// All lights, directional first, then spot, then point.
    pub fn lights(&self) -> impl Iterator<Item = &LightView> {
        self.directional_lights
            .iter()
            .chain(self.spot_lights.iter())
            .chain(self.point_lights.iter())
    }

    pub fn light_count(&self) -> usize {
        self.directional_lights.len() + self.spot_lights.len() + self.point_lights.len()
    }

    pub fn camera(&self) -> Option<&CameraView> {
        self.camera.as_ref()
    }

    pub fn ibl(&self) -> Option<&IblView> {
        self.ibl.as_ref()
    }

    pub fn command_buffer(&self) -> Option<CommandBufferHandle> {
        self.command_buffer
    }

    pub fn acceleration_structure(&self) -> Option<AccelerationStructureHandle> {
        self.acceleration_structure
    }

    /// Registers the camera seen during traversal. The preferred camera wins;
    /// without one the first offered camera is kept.
    pub(crate) fn offer_camera(&mut self, camera: CameraView) {
        match self.preferred_camera {
            Some(preferred) if preferred == camera.node => self.camera = Some(camera),
            Some(_) if self.fallback_camera.is_none() => self.fallback_camera = Some(camera),
            Some(_) => (),
            None if self.camera.is_none() => self.camera = Some(camera),
            None => (),
        }
    }

    /// Falls back to the first offered camera when the preferred one was not
    /// reached during traversal.
    pub(crate) fn resolve_camera(&mut self) {
        if self.camera.is_none() {
            if let Some(preferred) = self.preferred_camera {
                log::warn!("Active camera {:?} is not enabled in the scene", preferred);
            }
            self.camera = self.fallback_camera.take();
        }
    }

    pub(crate) fn push_light(&mut self, light: LightView) {
        match light.kind {
            LightKind::Directional => self.directional_lights.push(light),
            LightKind::Spot => self.spot_lights.push(light),
            LightKind::Point => self.point_lights.push(light),
        }
    }
}

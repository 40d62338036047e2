//! The GPU backend interface.
//!
//! The core never creates GPU objects directly. It talks to a [`GpuBackend`]
//! through opaque handles and records commands against a
//! [`CommandBufferHandle`] obtained from [`GpuBackend::begin_frame`]. The
//! shipped implementation is [`wgpu_backend::WgpuBackend`]; tests drive the
//! core with a recording backend instead.
//!
//! Every record that crosses the interface as raw bytes is `#[repr(C)]` and
//! `bytemuck::Pod`, laid out for 16 byte aligned storage/uniform buffers.

pub mod wgpu_backend;

use crate::data_structures::{mesh::Aabb, transform::to_rows_3x4};
use crate::render_state::MeshInstance;

use cgmath::{Matrix4, SquareMatrix};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccelerationStructureHandle(pub u32);

/// A command buffer is bound to one frame-in-flight slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub u32);

/// What a buffer is used for. Determines memory placement and usage flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Host-visible upload buffer for instance records.
    InstanceStaging,
    /// Device-local instance records read by acceleration-structure builds.
    InstanceDevice,
    /// Device-local scratch memory for acceleration-structure builds.
    Scratch,
    /// Small per-frame parameter block.
    Uniform,
    /// Read-only storage written from the host (e.g. lights).
    Storage,
    /// Storage written by the debug-ray pipeline and read by the overlay.
    DebugRays,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub kind: BufferKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// HDR accumulation target.
    Rgba32Float,
    /// Same format as the presentation target, used for capture staging.
    Presentation,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
    /// Production path tracing.
    PathTrace,
    /// Single-bounce primary visibility preview.
    Preview,
    /// Per-pixel debug ray gathering.
    DebugRays,
    ToneMap,
    DebugOverlay,
}

/// Memory dependencies the core asks for explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    /// Instance upload must land before the acceleration-structure build reads it.
    TransferToAccelerationBuild,
    /// The build must finish before ray dispatches read the structure.
    AccelerationBuildToTrace,
    /// Ray dispatches must finish writing accumulation before tone mapping reads it.
    TraceToToneMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Full build from scratch; required when instance count or topology changed.
    Build,
    /// Refit in place reusing the existing structure and scratch memory.
    Update,
}

/// Axis-aligned pixel region of the image plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn full(extent: (u32, u32)) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.0,
            height: extent.1,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

#[derive(Clone, Debug)]
pub struct AccelerationStructureBuild {
    pub structure: AccelerationStructureHandle,
    pub instances: BufferHandle,
    pub instance_count: u32,
    pub scratch: BufferHandle,
    pub mode: BuildMode,
}

#[derive(Clone, Debug)]
pub struct TraceDispatch {
    pub pipeline: PipelineHandle,
    pub structure: Option<AccelerationStructureHandle>,
    /// Holds a [`TraceParams`] block.
    pub params: BufferHandle,
    /// Holds `light_count` [`crate::data_structures::light::LightRaw`] records.
    pub lights: BufferHandle,
    pub accumulation: ImageHandle,
    pub region: Region,
}

#[derive(Clone, Debug)]
pub struct DebugRayDispatch {
    pub pipeline: PipelineHandle,
    pub structure: Option<AccelerationStructureHandle>,
    /// Holds a [`DebugRayParams`] block.
    pub params: BufferHandle,
    /// Receives `ray_count * bounce_limit` [`DebugRaySample`] records.
    pub output: BufferHandle,
    pub ray_count: u32,
}

#[derive(Clone, Debug)]
pub struct ToneMapPass {
    pub pipeline: PipelineHandle,
    pub source: ImageHandle,
    pub target: ImageHandle,
    /// Holds a [`ToneMapParams`] block.
    pub params: BufferHandle,
}

#[derive(Clone, Debug)]
pub struct DebugOverlayPass {
    pub pipeline: PipelineHandle,
    pub rays: BufferHandle,
    pub sample_count: u32,
    pub target: ImageHandle,
    /// Holds a [`DebugOverlayParams`] block.
    pub params: BufferHandle,
}

/// Tightly packed RGBA8 pixels read back from an image.
#[derive(Clone, Debug)]
pub struct CapturedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Everything the core needs from a GPU. Methods that record commands take the
/// command buffer of the current frame; any failure means the frame cannot be
/// completed and is propagated to the caller.
pub trait GpuBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> anyhow::Result<BufferHandle>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn create_image(&mut self, desc: &ImageDesc) -> anyhow::Result<ImageHandle>;

    fn destroy_image(&mut self, image: ImageHandle);

    /// Creates a top-level structure able to hold `max_instances` instances.
    fn create_acceleration_structure(
        &mut self,
        max_instances: u32,
    ) -> anyhow::Result<AccelerationStructureHandle>;

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructureHandle);

    /// Scratch memory needed to build or update a structure of `max_instances`.
    fn acceleration_structure_scratch_size(&self, max_instances: u32) -> u64;

    fn create_pipeline(&mut self, kind: PipelineKind) -> anyhow::Result<PipelineHandle>;

    /// Host write into a buffer. Only valid for slots whose previous
    /// submission has completed (see [`GpuBackend::begin_frame`]).
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Waits until the previous submission of `frame_slot` has finished on the
    /// GPU and opens a fresh command buffer for it.
    fn begin_frame(&mut self, frame_slot: usize) -> anyhow::Result<CommandBufferHandle>;

    /// Acquires the image to present into. `None` means the target is out of
    /// date and must be resized before rendering continues.
    fn acquire_target(&mut self) -> anyhow::Result<Option<ImageHandle>>;

    fn resize_target(&mut self, width: u32, height: u32) -> anyhow::Result<()>;

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> anyhow::Result<()>;

    fn cmd_barrier(&mut self, cmd: CommandBufferHandle, barrier: Barrier) -> anyhow::Result<()>;

    fn cmd_build_acceleration_structure(
        &mut self,
        cmd: CommandBufferHandle,
        build: &AccelerationStructureBuild,
    ) -> anyhow::Result<()>;

    fn cmd_trace_rays(&mut self, cmd: CommandBufferHandle, dispatch: &TraceDispatch) -> anyhow::Result<()>;

    fn cmd_trace_debug_rays(
        &mut self,
        cmd: CommandBufferHandle,
        dispatch: &DebugRayDispatch,
    ) -> anyhow::Result<()>;

    fn cmd_tone_map(&mut self, cmd: CommandBufferHandle, pass: &ToneMapPass) -> anyhow::Result<()>;

    fn cmd_draw_debug_rays(
        &mut self,
        cmd: CommandBufferHandle,
        pass: &DebugOverlayPass,
    ) -> anyhow::Result<()>;

    fn cmd_copy_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> anyhow::Result<()>;

    /// Submits the command buffer and presents `present` if given.
    fn submit(&mut self, cmd: CommandBufferHandle, present: Option<ImageHandle>) -> anyhow::Result<()>;

    /// Blocks until the image's contents are available on the host.
    fn read_image(&mut self, image: ImageHandle) -> anyhow::Result<CapturedImage>;
}

/**
 * The raw instance is the record stored in the instance buffers and consumed
 * by acceleration-structure builds.
 *
 * Transforms are row-major 3x4 (the last row of an affine matrix is implicit).
 */
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRaw {
    pub object_to_world: [[f32; 4]; 3],
    pub world_to_object: [[f32; 4]; 3],
    pub bounds_min: [f32; 3],
    pub custom_index: u32,
    pub bounds_max: [f32; 3],
    pub mask: u32,
    pub material_id: u32,
    /// Hit-group offset into the shader binding table.
    pub shader_offset: u32,
    pub flags: u32,
    pub _padding: u32,
}

/// Material id written for instances without a material.
pub const NO_MATERIAL: u32 = u32::MAX;

impl InstanceRaw {
    pub fn from_instance(instance: &MeshInstance) -> Self {
        let inverse = instance.model.invert().unwrap_or_else(Matrix4::identity);
        let Aabb { min, max } = instance.bounds;
        Self {
            object_to_world: to_rows_3x4(&instance.model),
            world_to_object: to_rows_3x4(&inverse),
            bounds_min: min.into(),
            custom_index: instance.custom_index,
            bounds_max: max.into(),
            mask: 0xff,
            material_id: instance.material.map_or(NO_MATERIAL, |m| m.0),
            shader_offset: 0,
            flags: 0,
            _padding: 0,
        }
    }
}

/// Parameters of one sample pass.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TraceParams {
    pub inverse_view: [[f32; 4]; 4],
    pub inverse_projection: [[f32; 4]; 4],
    /// Weight of the already accumulated mean: `N / (N + 1)`.
    pub accumulation_weight: f32,
    pub light_count: u32,
    pub frame_index: u32,
    pub bounce_limit: u32,
    pub region_origin: [u32; 2],
    pub region_extent: [u32; 2],
    pub image_extent: [u32; 2],
    pub instance_count: u32,
    /// Sample index within the dispatched region, seeds the shader RNG.
    pub sample_index: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DebugRayParams {
    pub inverse_view: [[f32; 4]; 4],
    pub inverse_projection: [[f32; 4]; 4],
    pub pixel: [u32; 2],
    pub ray_count: u32,
    pub bounce_limit: u32,
    pub image_extent: [u32; 2],
    pub instance_count: u32,
    pub frame_index: u32,
}

/// One path segment written by the debug-ray pipeline.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DebugRaySample {
    pub origin: [f32; 3],
    pub ray: u32,
    pub direction: [f32; 3],
    /// Distance to the hit, or zero for segments after the path terminated.
    pub distance: f32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ToneMapParams {
    pub exposure: f32,
    pub operator: u32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DebugOverlayParams {
    pub view_projection: [[f32; 4]; 4],
    pub bounce_limit: u32,
    pub _padding: [u32; 3],
}

//! Integrators turn a [`RenderState`] into ray dispatches that accumulate
//! into an HDR image.
//!
//! Accumulation is a running mean: the pass for sample `N + 1` blends its
//! radiance with weight `1 / (N + 1)` and keeps the stored mean with weight
//! `N / (N + 1)`. A bake is the session between two resets of that counter.

use anyhow::{anyhow, ensure};
use cgmath::{Matrix4, SquareMatrix};

use crate::{
    config::RenderSettings,
    data_structures::light::LightRaw,
    gpu::{
        BufferDesc, BufferHandle, BufferKind, CommandBufferHandle, DebugRayDispatch, DebugRayParams,
        DebugRaySample, GpuBackend, ImageDesc, ImageFormat, ImageHandle, PipelineHandle, PipelineKind,
        Region, TraceDispatch, TraceParams,
    },
    render_state::{CameraView, RenderState},
    scene::SceneState,
};

/// Result of one [`Integrator::render`] call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DispatchOutcome {
    /// One sample pass was recorded.
    Dispatched {
        region: Region,
        /// Samples the region held before this pass.
        sample_index: u32,
        accumulation_weight: f32,
    },
    /// No camera is bound this frame.
    NoCamera,
    /// The image has zero area.
    NoTarget,
    /// The bake reached its sample target.
    BakeComplete,
}

/// Debug-ray samples gathered for one pixel. Both buffers are owned by the
/// caller from here on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugRayBatch {
    pub pixel: (u32, u32),
    pub buffer: BufferHandle,
    /// The [`DebugRayParams`] block the batch was traced with.
    pub params: BufferHandle,
    /// Number of [`DebugRaySample`] records in `buffer`.
    pub sample_count: u32,
    pub bounce_limit: u32,
}

pub trait Integrator {
    fn name(&self) -> &'static str;

    /// Records at most one sample pass for the frame in `state`.
    fn render(
        &mut self,
        backend: &mut dyn GpuBackend,
        state: &RenderState,
    ) -> anyhow::Result<DispatchOutcome>;

    /// Traces `count` paths through `pixel` with the camera bound in `state`
    /// and records every bounce. Leaves the accumulation untouched.
    fn gather_debug_rays(
        &mut self,
        _backend: &mut dyn GpuBackend,
        _state: &RenderState,
        _pixel: (u32, u32),
        _count: u32,
    ) -> anyhow::Result<Option<DebugRayBatch>> {
        log::warn!("{} integrator does not support debug rays", self.name());
        Ok(None)
    }

    /// Drops all accumulated samples. Only resets bookkeeping; work already
    /// submitted to the GPU still completes.
    fn restart_bake(&mut self);

    /// Recreates resolution-dependent images and restarts the bake.
    fn resize(&mut self, backend: &mut dyn GpuBackend, extent: (u32, u32)) -> anyhow::Result<()>;

    fn apply_settings(
        &mut self,
        backend: &mut dyn GpuBackend,
        settings: &RenderSettings,
    ) -> anyhow::Result<()>;

    /// The HDR image samples accumulate into, once allocated.
    fn accumulation_image(&self) -> Option<ImageHandle>;

    /// Samples accumulated in the current bake, over all tiles.
    fn accumulated_samples(&self) -> u32;

    fn release(&mut self, backend: &mut dyn GpuBackend);
}

/// Running-mean weight of the stored accumulation after `samples` samples.
pub fn accumulation_weight(samples: u32) -> f32 {
    samples as f32 / (samples as f32 + 1.0)
}

/// Splits `extent` into row-major square tiles of `tile_size`; edge tiles are
/// clipped to the image.
pub fn compute_tiles(extent: (u32, u32), tile_size: u32) -> Vec<Region> {
    let (width, height) = extent;
    if width == 0 || height == 0 || tile_size == 0 {
        return Vec::new();
    }
    (0..height.div_ceil(tile_size))
        .flat_map(|row| {
            (0..width.div_ceil(tile_size)).map(move |column| {
                let x = column * tile_size;
                let y = row * tile_size;
                Region {
                    x,
                    y,
                    width: tile_size.min(width - x),
                    height: tile_size.min(height - y),
                }
            })
        })
        .collect()
}

fn matrix_rows(matrix: Matrix4<f32>) -> [[f32; 4]; 4] {
    matrix.into()
}

fn inverse_or_identity(matrix: &Matrix4<f32>) -> Matrix4<f32> {
    matrix.invert().unwrap_or_else(Matrix4::identity)
}

#[derive(Debug, Clone, Copy)]
struct FrameSlot {
    params: BufferHandle,
    lights: BufferHandle,
}

/// GPU objects shared by the integrator variants: the accumulation image and
/// one parameter and light buffer per frame in flight.
#[derive(Debug)]
struct TraceTargets {
    label: &'static str,
    extent: (u32, u32),
    accumulation: Option<ImageHandle>,
    slots: Vec<FrameSlot>,
    frames_in_flight: usize,
    max_lights: u32,
}

impl TraceTargets {
    fn new(label: &'static str, settings: &RenderSettings) -> Self {
        Self {
            label,
            extent: (0, 0),
            accumulation: None,
            slots: Vec::new(),
            frames_in_flight: settings.frames_in_flight,
            max_lights: settings.max_lights,
        }
    }

    /// Returns whether the accumulation image had to be recreated.
    fn ensure(&mut self, backend: &mut dyn GpuBackend, extent: (u32, u32)) -> anyhow::Result<bool> {
        if self.slots.is_empty() {
            for slot in 0..self.frames_in_flight {
                self.slots.push(FrameSlot {
                    params: backend.create_buffer(&BufferDesc {
                        label: format!("{} Trace Params {}", self.label, slot),
                        size: std::mem::size_of::<TraceParams>() as u64,
                        kind: BufferKind::Uniform,
                    })?,
                    lights: backend.create_buffer(&BufferDesc {
                        label: format!("{} Lights {}", self.label, slot),
                        size: (std::mem::size_of::<LightRaw>() as u64) * self.max_lights.max(1) as u64,
                        kind: BufferKind::Storage,
                    })?,
                });
            }
        }
        if self.accumulation.is_some() && self.extent == extent {
            return Ok(false);
        }
        if let Some(image) = self.accumulation.take() {
            backend.destroy_image(image);
        }
        self.extent = extent;
        if extent.0 == 0 || extent.1 == 0 {
            return Ok(true);
        }
        self.accumulation = Some(backend.create_image(&ImageDesc {
            label: format!("{} Accumulation", self.label),
            width: extent.0,
            height: extent.1,
            format: ImageFormat::Rgba32Float,
        })?);
        log::debug!("{} accumulation image {}x{}", self.label, extent.0, extent.1);
        Ok(true)
    }

    fn slot(&self, frame_slot: usize) -> anyhow::Result<FrameSlot> {
        ensure!(!self.slots.is_empty(), "{} frame slots are not allocated", self.label);
        Ok(self.slots[frame_slot % self.slots.len()])
    }

    fn release_slots(&mut self, backend: &mut dyn GpuBackend) {
        for slot in self.slots.drain(..) {
            backend.destroy_buffer(slot.params);
            backend.destroy_buffer(slot.lights);
        }
    }

    fn release(&mut self, backend: &mut dyn GpuBackend) {
        self.release_slots(backend);
        if let Some(image) = self.accumulation.take() {
            backend.destroy_image(image);
        }
        self.extent = (0, 0);
    }

    /// Capacity changes only take effect after the slots are recreated.
    fn apply_settings(&mut self, backend: &mut dyn GpuBackend, settings: &RenderSettings) {
        if settings.max_lights != self.max_lights || settings.frames_in_flight != self.frames_in_flight {
            self.release_slots(backend);
            self.max_lights = settings.max_lights;
            self.frames_in_flight = settings.frames_in_flight;
        }
    }

    /// Writes the frame's parameters and lights and records one sample pass.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        backend: &mut dyn GpuBackend,
        state: &RenderState,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        camera: &CameraView,
        region: Region,
        sample_index: u32,
        bounce_limit: u32,
    ) -> anyhow::Result<f32> {
        let accumulation = self
            .accumulation
            .ok_or_else(|| anyhow!("{} accumulation image is not allocated", self.label))?;
        let slot = self.slot(state.frame_slot())?;
        let weight = accumulation_weight(sample_index);
        let params = TraceParams {
            inverse_view: matrix_rows(inverse_or_identity(&camera.view)),
            inverse_projection: matrix_rows(inverse_or_identity(&camera.projection)),
            accumulation_weight: weight,
            light_count: state.light_count() as u32,
            frame_index: state.frame_index() as u32,
            bounce_limit,
            region_origin: [region.x, region.y],
            region_extent: [region.width, region.height],
            image_extent: [self.extent.0, self.extent.1],
            instance_count: state.meshes().len() as u32,
            sample_index,
        };
        backend.write_buffer(slot.params, 0, bytemuck::bytes_of(&params))?;
        let lights: Vec<LightRaw> = state.lights().map(|light| light.to_raw()).collect();
        if !lights.is_empty() {
            backend.write_buffer(slot.lights, 0, bytemuck::cast_slice(&lights))?;
        }
        backend.cmd_trace_rays(
            cmd,
            &TraceDispatch {
                pipeline,
                structure: state.acceleration_structure(),
                params: slot.params,
                lights: slot.lights,
                accumulation,
                region,
            },
        )?;
        Ok(weight)
    }
}

/// Production integrator: multi-bounce path tracing with optional tiling and
/// per-pixel debug rays.
#[derive(Debug)]
pub struct PathIntegrator {
    targets: TraceTargets,
    pipeline: Option<PipelineHandle>,
    debug_pipeline: Option<PipelineHandle>,
    max_samples: u32,
    bounce_limit: u32,
    max_lights: u32,
    tile_size: u32,
    tiled: bool,
    tiles: Vec<Region>,
    tile_index: usize,
    /// Samples in the current tile, or in the full image when not tiled.
    region_samples: u32,
    accumulated_samples: u32,
}

impl PathIntegrator {
    pub fn new(settings: &RenderSettings) -> Self {
        Self {
            targets: TraceTargets::new("Path Integrator", settings),
            pipeline: None,
            debug_pipeline: None,
            max_samples: settings.max_samples,
            bounce_limit: settings.bounce_limit,
            max_lights: settings.max_lights,
            tile_size: settings.tile_size,
            tiled: settings.tiled,
            tiles: Vec::new(),
            tile_index: 0,
            region_samples: 0,
            accumulated_samples: 0,
        }
    }

    pub fn tile_index(&self) -> usize {
        self.tile_index
    }

    pub fn tiles(&self) -> &[Region] {
        &self.tiles
    }

    pub fn is_tiled(&self) -> bool {
        self.tiled
    }

    pub fn max_samples(&self) -> u32 {
        self.max_samples
    }

    /// Total samples a bake needs before it is complete.
    pub fn bake_target(&self) -> u64 {
        if self.tiled {
            self.max_samples as u64 * self.tiles.len() as u64
        } else {
            self.max_samples as u64
        }
    }

    pub fn is_bake_complete(&self) -> bool {
        self.accumulated_samples as u64 >= self.bake_target()
    }

    fn current_region(&self) -> Option<Region> {
        if self.tiled {
            self.tiles.get(self.tile_index).copied()
        } else {
            Some(Region::full(self.targets.extent))
        }
    }

    fn advance(&mut self) {
        self.accumulated_samples += 1;
        self.region_samples += 1;
        if self.tiled && self.region_samples >= self.max_samples {
            self.tile_index += 1;
            self.region_samples = 0;
            log::debug!("Tile {} of {} converged", self.tile_index, self.tiles.len());
        }
    }

    fn ensure_pipelines(&mut self, backend: &mut dyn GpuBackend) -> anyhow::Result<PipelineHandle> {
        if let Some(pipeline) = self.pipeline {
            return Ok(pipeline);
        }
        let pipeline = backend.create_pipeline(PipelineKind::PathTrace)?;
        self.pipeline = Some(pipeline);
        Ok(pipeline)
    }

    fn ensure_targets(&mut self, backend: &mut dyn GpuBackend, extent: (u32, u32)) -> anyhow::Result<()> {
        if self.targets.ensure(backend, extent)? {
            self.tiles = compute_tiles(extent, self.tile_size);
            self.restart_bake();
        }
        Ok(())
    }
}

impl Integrator for PathIntegrator {
    fn name(&self) -> &'static str {
        "Path"
    }

    fn render(
        &mut self,
        backend: &mut dyn GpuBackend,
        state: &RenderState,
    ) -> anyhow::Result<DispatchOutcome> {
        if state.scene_state() != SceneState::Ready {
            self.restart_bake();
        }
        ensure!(
            state.light_count() <= self.max_lights as usize,
            "scene has {} lights but at most {} are supported",
            state.light_count(),
            self.max_lights
        );
        self.ensure_targets(backend, state.extent())?;
        if self.targets.accumulation.is_none() {
            return Ok(DispatchOutcome::NoTarget);
        }
        let Some(camera) = state.camera() else {
            log::trace!("No camera bound, skipping path trace dispatch");
            return Ok(DispatchOutcome::NoCamera);
        };
        if self.is_bake_complete() {
            return Ok(DispatchOutcome::BakeComplete);
        }
        let Some(region) = self.current_region() else {
            return Ok(DispatchOutcome::BakeComplete);
        };
        let cmd = state
            .command_buffer()
            .ok_or_else(|| anyhow!("render state has no active command buffer"))?;
        let pipeline = self.ensure_pipelines(backend)?;

        let sample_index = self.region_samples;
        let accumulation_weight = self.targets.dispatch(
            backend,
            state,
            cmd,
            pipeline,
            camera,
            region,
            sample_index,
            self.bounce_limit,
        )?;
        self.advance();
        Ok(DispatchOutcome::Dispatched {
            region,
            sample_index,
            accumulation_weight,
        })
    }

    fn gather_debug_rays(
        &mut self,
        backend: &mut dyn GpuBackend,
        state: &RenderState,
        pixel: (u32, u32),
        count: u32,
    ) -> anyhow::Result<Option<DebugRayBatch>> {
        let (width, height) = state.extent();
        let Some(camera) = state.camera() else {
            log::debug!("No camera bound, ignoring debug ray request");
            return Ok(None);
        };
        if count == 0 || pixel.0 >= width || pixel.1 >= height {
            log::debug!("Debug ray request for {:?} is outside of {}x{}", pixel, width, height);
            return Ok(None);
        }
        let cmd = state
            .command_buffer()
            .ok_or_else(|| anyhow!("render state has no active command buffer"))?;
        self.ensure_targets(backend, state.extent())?;
        let pipeline = match self.debug_pipeline {
            Some(pipeline) => pipeline,
            None => {
                let pipeline = backend.create_pipeline(PipelineKind::DebugRays)?;
                self.debug_pipeline = Some(pipeline);
                pipeline
            }
        };

        let bounce_limit = self.bounce_limit.max(1);
        let sample_count = count
            .checked_mul(bounce_limit)
            .ok_or_else(|| anyhow!("{} debug rays with {} bounces overflow", count, bounce_limit))?;
        let output = backend.create_buffer(&BufferDesc {
            label: format!("Debug Rays {}x{}", pixel.0, pixel.1),
            size: sample_count as u64 * std::mem::size_of::<DebugRaySample>() as u64,
            kind: BufferKind::DebugRays,
        })?;
        // one params block per batch, host writes are not ordered against
        // commands recorded in the same frame
        let params_buffer = match backend.create_buffer(&BufferDesc {
            label: format!("Debug Ray Params {}x{}", pixel.0, pixel.1),
            size: std::mem::size_of::<DebugRayParams>() as u64,
            kind: BufferKind::Uniform,
        }) {
            Ok(buffer) => buffer,
            Err(error) => {
                backend.destroy_buffer(output);
                return Err(error);
            }
        };
        let params = DebugRayParams {
            inverse_view: matrix_rows(inverse_or_identity(&camera.view)),
            inverse_projection: matrix_rows(inverse_or_identity(&camera.projection)),
            pixel: [pixel.0, pixel.1],
            ray_count: count,
            bounce_limit,
            image_extent: [width, height],
            instance_count: state.meshes().len() as u32,
            frame_index: state.frame_index() as u32,
        };
        let recorded = backend
            .write_buffer(params_buffer, 0, bytemuck::bytes_of(&params))
            .and_then(|()| {
                backend.cmd_trace_debug_rays(
                    cmd,
                    &DebugRayDispatch {
                        pipeline,
                        structure: state.acceleration_structure(),
                        params: params_buffer,
                        output,
                        ray_count: count,
                    },
                )
            });
        if let Err(error) = recorded {
            backend.destroy_buffer(params_buffer);
            backend.destroy_buffer(output);
            return Err(error);
        }
        Ok(Some(DebugRayBatch {
            pixel,
            buffer: output,
            params: params_buffer,
            sample_count,
            bounce_limit,
        }))
    }

    fn restart_bake(&mut self) {
        self.accumulated_samples = 0;
        self.region_samples = 0;
        self.tile_index = 0;
    }

    fn resize(&mut self, backend: &mut dyn GpuBackend, extent: (u32, u32)) -> anyhow::Result<()> {
        self.ensure_targets(backend, extent)?;
        self.restart_bake();
        Ok(())
    }

    fn apply_settings(
        &mut self,
        backend: &mut dyn GpuBackend,
        settings: &RenderSettings,
    ) -> anyhow::Result<()> {
        settings.validate()?;
        let restart = self.max_samples != settings.max_samples
            || self.bounce_limit != settings.bounce_limit
            || self.tile_size != settings.tile_size
            || self.tiled != settings.tiled;
        self.targets.apply_settings(backend, settings);
        self.max_samples = settings.max_samples;
        self.bounce_limit = settings.bounce_limit;
        self.max_lights = settings.max_lights;
        if self.tile_size != settings.tile_size {
            self.tile_size = settings.tile_size;
            self.tiles = compute_tiles(self.targets.extent, self.tile_size);
        }
        self.tiled = settings.tiled;
        if restart {
            self.restart_bake();
        }
        Ok(())
    }

    fn accumulation_image(&self) -> Option<ImageHandle> {
        self.targets.accumulation
    }

    fn accumulated_samples(&self) -> u32 {
        self.accumulated_samples
    }

    fn release(&mut self, backend: &mut dyn GpuBackend) {
        self.targets.release(backend);
        self.pipeline = None;
        self.debug_pipeline = None;
        self.restart_bake();
    }
}

/// Fast preview: a single primary-visibility sample per scene change.
#[derive(Debug)]
pub struct PreviewIntegrator {
    targets: TraceTargets,
    pipeline: Option<PipelineHandle>,
    max_lights: u32,
    accumulated_samples: u32,
}

impl PreviewIntegrator {
    pub fn new(settings: &RenderSettings) -> Self {
        Self {
            targets: TraceTargets::new("Preview Integrator", settings),
            pipeline: None,
            max_lights: settings.max_lights,
            accumulated_samples: 0,
        }
    }
}

impl Integrator for PreviewIntegrator {
    fn name(&self) -> &'static str {
        "Preview"
    }

    fn render(
        &mut self,
        backend: &mut dyn GpuBackend,
        state: &RenderState,
    ) -> anyhow::Result<DispatchOutcome> {
        if state.scene_state() != SceneState::Ready {
            self.restart_bake();
        }
        ensure!(
            state.light_count() <= self.max_lights as usize,
            "scene has {} lights but at most {} are supported",
            state.light_count(),
            self.max_lights
        );
        if self.targets.ensure(backend, state.extent())? {
            self.restart_bake();
        }
        if self.targets.accumulation.is_none() {
            return Ok(DispatchOutcome::NoTarget);
        }
        let Some(camera) = state.camera() else {
            return Ok(DispatchOutcome::NoCamera);
        };
        if self.accumulated_samples > 0 {
            return Ok(DispatchOutcome::BakeComplete);
        }
        let cmd = state
            .command_buffer()
            .ok_or_else(|| anyhow!("render state has no active command buffer"))?;
        let pipeline = match self.pipeline {
            Some(pipeline) => pipeline,
            None => {
                let pipeline = backend.create_pipeline(PipelineKind::Preview)?;
                self.pipeline = Some(pipeline);
                pipeline
            }
        };
        let region = Region::full(self.targets.extent);
        let accumulation_weight =
            self.targets
                .dispatch(backend, state, cmd, pipeline, camera, region, 0, 1)?;
        self.accumulated_samples = 1;
        Ok(DispatchOutcome::Dispatched {
            region,
            sample_index: 0,
            accumulation_weight,
        })
    }

    fn restart_bake(&mut self) {
        self.accumulated_samples = 0;
    }

    fn resize(&mut self, backend: &mut dyn GpuBackend, extent: (u32, u32)) -> anyhow::Result<()> {
        self.targets.ensure(backend, extent)?;
        self.restart_bake();
        Ok(())
    }

    fn apply_settings(
        &mut self,
        backend: &mut dyn GpuBackend,
        settings: &RenderSettings,
    ) -> anyhow::Result<()> {
        settings.validate()?;
        self.targets.apply_settings(backend, settings);
        self.max_lights = settings.max_lights;
        Ok(())
    }

    fn accumulation_image(&self) -> Option<ImageHandle> {
        self.targets.accumulation
    }

    fn accumulated_samples(&self) -> u32 {
        self.accumulated_samples
    }

    fn release(&mut self, backend: &mut dyn GpuBackend) {
        self.targets.release(backend);
        self.pipeline = None;
        self.restart_bake();
    }
}

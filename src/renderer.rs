//! Frame orchestration.
//!
//! [`Renderer::render_frame`] runs one frame end to end: it waits on the
//! frame-in-flight slot, acquires the presentation target, updates the scene
//! and its acceleration structure, lets the integrator accumulate a sample,
//! tone-maps, composites debug-ray overlays, optionally captures to disk and
//! presents.

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, ensure};

use crate::{
    config::RenderSettings,
    gpu::{
        Barrier, BufferDesc, BufferHandle, BufferKind, CommandBufferHandle, DebugOverlayParams,
        DebugOverlayPass, GpuBackend, ImageDesc, ImageFormat, ImageHandle, PipelineHandle,
        PipelineKind, ToneMapParams, ToneMapPass,
    },
    integrator::{DebugRayBatch, DispatchOutcome, Integrator},
    render_state::RenderState,
    resources::ResourceManager,
    scene::{AccelerationUpdate, Scene, SceneState},
};

/// What happened during one [`Renderer::render_frame`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    /// `false` when the presentation target was out of date and the frame was
    /// skipped.
    pub presented: bool,
    pub scene_state: SceneState,
    pub acceleration: AccelerationUpdate,
    pub dispatch: Option<DispatchOutcome>,
    /// Path of the image written for a capture request during this frame.
    pub captured: Option<PathBuf>,
}

impl FrameReport {
    fn skipped(frame_index: u64) -> Self {
        Self {
            frame_index,
            presented: false,
            scene_state: SceneState::Ready,
            acceleration: AccelerationUpdate::Skipped,
            dispatch: None,
            captured: None,
        }
    }
}

/// Debug rays gathered for one pixel, drawn every frame until cleared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugView {
    pub pixel: (u32, u32),
    pub ray_count: u32,
    pub batch: DebugRayBatch,
}

#[derive(Clone, Copy, Debug)]
struct DebugRayRequest {
    pixel: (u32, u32),
    count: u32,
}

#[derive(Clone, Copy, Debug)]
struct FrameSlot {
    tone_map: BufferHandle,
    overlay: BufferHandle,
}

pub struct Renderer<B: GpuBackend> {
    backend: B,
    integrator: Box<dyn Integrator>,
    settings: RenderSettings,
    state: RenderState,
    extent: (u32, u32),
    frame_index: u64,
    resize_pending: bool,
    tone_map_pipeline: Option<PipelineHandle>,
    overlay_pipeline: Option<PipelineHandle>,
    slots: Vec<FrameSlot>,
    debug_requests: Vec<DebugRayRequest>,
    debug_views: Vec<DebugView>,
    capture_request: Option<PathBuf>,
    capture_image: Option<ImageHandle>,
}

impl<B: GpuBackend> Renderer<B> {
    pub fn new(
        backend: B,
        integrator: Box<dyn Integrator>,
        settings: RenderSettings,
        extent: (u32, u32),
    ) -> anyhow::Result<Self> {
        settings.validate()?;
        Ok(Self {
            backend,
            integrator,
            settings,
            state: RenderState::new(extent),
            extent,
            frame_index: 0,
            resize_pending: true,
            tone_map_pipeline: None,
            overlay_pipeline: None,
            slots: Vec::new(),
            debug_requests: Vec::new(),
            debug_views: Vec::new(),
            capture_request: None,
            capture_image: None,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn integrator(&self) -> &dyn Integrator {
        self.integrator.as_ref()
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn debug_views(&self) -> &[DebugView] {
        &self.debug_views
    }

    /// Applies new settings without a restart. Settings that change what a
    /// sample means restart the bake; capacity changes reallocate buffers on
    /// the next frame and take effect in `scene` and `resources` right away.
    pub fn apply_settings(
        &mut self,
        scene: &mut Scene,
        resources: &mut ResourceManager,
        settings: RenderSettings,
    ) -> anyhow::Result<()> {
        settings.validate()?;
        self.integrator.apply_settings(&mut self.backend, &settings)?;
        if self.settings.invalidates_bake(&settings) {
            log::debug!("Render settings changed, restarting bake");
            self.integrator.restart_bake();
        }
        if settings.frames_in_flight != self.settings.frames_in_flight {
            self.release_slots();
        }
        scene.set_max_instances(settings.max_instances);
        resources.set_max_materials(settings.max_materials);
        self.settings = settings;
        Ok(())
    }

    /// Restarts the bake without touching the scene.
    pub fn restart_bake(&mut self) {
        self.integrator.restart_bake();
    }

    /// Resizes the presentation target. The next frame recreates the
    /// accumulation image and discards every accumulated sample.
    pub fn on_window_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        self.backend.resize_target(width, height)?;
        self.extent = (width, height);
        self.resize_pending = true;
        if let Some(image) = self.capture_image.take() {
            self.backend.destroy_image(image);
        }
        Ok(())
    }

    /// Gathers `count` debug rays through `pixel` on the next frame and draws
    /// them every frame until [`Renderer::clear_debug_views`].
    pub fn request_debug_rays(&mut self, pixel: (u32, u32), count: u32) {
        self.debug_requests.push(DebugRayRequest { pixel, count });
    }

    pub fn clear_debug_views(&mut self) {
        self.debug_requests.clear();
        for view in self.debug_views.drain(..) {
            self.backend.destroy_buffer(view.batch.buffer);
            self.backend.destroy_buffer(view.batch.params);
        }
    }

    /// Writes the next presented image to `path` as PNG. The request is
    /// consumed by the frame that serves it.
    pub fn request_capture(&mut self, path: impl AsRef<Path>) {
        self.capture_request = Some(path.as_ref().to_path_buf());
    }

    pub fn has_pending_capture(&self) -> bool {
        self.capture_request.is_some()
    }

    pub fn render_frame(&mut self, scene: &mut Scene) -> anyhow::Result<FrameReport> {
        let frame_index = self.frame_index;
        let frame_slot = (frame_index % self.settings.frames_in_flight as u64) as usize;
        let cmd = self.backend.begin_frame(frame_slot)?;
        let Some(target) = self.backend.acquire_target()? else {
            log::debug!("Presentation target is out of date, skipping frame {}", frame_index);
            self.resize_pending = true;
            self.backend.submit(cmd, None)?;
            return Ok(FrameReport::skipped(frame_index));
        };

        self.state
            .begin_frame(frame_index, frame_slot, self.extent, Some(cmd));
        let settled_views = self.debug_views.len();
        let result = self.record_frame(scene, cmd, target);
        self.state.end_frame();
        self.frame_index += 1;

        let mut report = match result {
            Ok(report) => {
                scene.end_frame();
                report
            }
            Err(error) => {
                // nothing recorded this frame reaches the GPU
                scene.abort_frame();
                self.integrator.restart_bake();
                self.requeue_debug_views(settled_views);
                self.capture_request = None;
                return Err(error.context(format!("frame {} aborted", frame_index)));
            }
        };
        if let Some(path) = report.captured.clone() {
            self.write_capture(&path)?;
            report.captured = Some(path);
        }
        Ok(report)
    }

    fn record_frame(
        &mut self,
        scene: &mut Scene,
        cmd: CommandBufferHandle,
        target: ImageHandle,
    ) -> anyhow::Result<FrameReport> {
        let scene_state = scene.update(&mut self.state);
        self.check_capacity(scene)?;
        let acceleration = scene.update_acceleration_structure(&mut self.backend, &mut self.state)?;

        if self.resize_pending {
            self.integrator.resize(&mut self.backend, self.extent)?;
            self.integrator.restart_bake();
            self.resize_pending = false;
        }
        let dispatch = self.integrator.render(&mut self.backend, &self.state)?;
        self.gather_debug_rays()?;

        let slot = self.ensure_slot()?;
        if let Some(accumulation) = self.integrator.accumulation_image() {
            self.backend.cmd_barrier(cmd, Barrier::TraceToToneMap)?;
            let pipeline = self.ensure_pipeline(PipelineKind::ToneMap)?;
            let params = ToneMapParams {
                exposure: self.settings.exposure,
                operator: self.settings.tone_map.shader_id(),
                width: self.extent.0,
                height: self.extent.1,
            };
            self.backend
                .write_buffer(slot.tone_map, 0, bytemuck::bytes_of(&params))?;
            self.backend.cmd_tone_map(
                cmd,
                &ToneMapPass {
                    pipeline,
                    source: accumulation,
                    target,
                    params: slot.tone_map,
                },
            )?;
        }
        self.draw_debug_views(cmd, slot, target)?;

        let captured = match self.capture_request.take() {
            Some(path) => {
                let staging = self.ensure_capture_image()?;
                self.backend.cmd_copy_image(cmd, target, staging)?;
                Some(path)
            }
            None => None,
        };
        self.backend.submit(cmd, Some(target))?;

        Ok(FrameReport {
            frame_index: self.state.frame_index(),
            presented: true,
            scene_state,
            acceleration,
            dispatch: Some(dispatch),
            captured,
        })
    }

    /// Views gathered by an aborted frame were never traced; their requests
    /// are retried on the next frame.
    fn requeue_debug_views(&mut self, settled: usize) {
        let unsettled: Vec<DebugView> = self.debug_views.drain(settled..).collect();
        for view in unsettled {
            self.backend.destroy_buffer(view.batch.buffer);
            self.backend.destroy_buffer(view.batch.params);
            self.debug_requests.push(DebugRayRequest {
                pixel: view.pixel,
                count: view.ray_count,
            });
        }
    }

    /// Capacity errors surface before the frame records any command.
    fn check_capacity(&self, scene: &Scene) -> anyhow::Result<()> {
        ensure!(
            self.state.light_count() <= self.settings.max_lights as usize,
            "scene has {} lights but at most {} are supported",
            self.state.light_count(),
            self.settings.max_lights
        );
        ensure!(
            self.state.meshes().len() <= scene.max_instances() as usize,
            "scene has {} mesh instances but the acceleration structure holds at most {}",
            self.state.meshes().len(),
            scene.max_instances()
        );
        Ok(())
    }

    fn gather_debug_rays(&mut self) -> anyhow::Result<()> {
        for request in std::mem::take(&mut self.debug_requests) {
            let batch = self.integrator.gather_debug_rays(
                &mut self.backend,
                &self.state,
                request.pixel,
                request.count,
            )?;
            if let Some(batch) = batch {
                log::debug!(
                    "Gathered {} debug rays through pixel {:?}",
                    request.count,
                    request.pixel
                );
                self.debug_views.push(DebugView {
                    pixel: request.pixel,
                    ray_count: request.count,
                    batch,
                });
            }
        }
        Ok(())
    }

    fn draw_debug_views(
        &mut self,
        cmd: CommandBufferHandle,
        slot: FrameSlot,
        target: ImageHandle,
    ) -> anyhow::Result<()> {
        if self.debug_views.is_empty() {
            return Ok(());
        }
        let Some(camera) = self.state.camera() else {
            return Ok(());
        };
        let params = DebugOverlayParams {
            view_projection: (camera.projection * camera.view).into(),
            bounce_limit: self.settings.bounce_limit,
            _padding: [0; 3],
        };
        self.backend
            .write_buffer(slot.overlay, 0, bytemuck::bytes_of(&params))?;
        let pipeline = self.ensure_pipeline(PipelineKind::DebugOverlay)?;
        for view in &self.debug_views {
            self.backend.cmd_draw_debug_rays(
                cmd,
                &DebugOverlayPass {
                    pipeline,
                    rays: view.batch.buffer,
                    sample_count: view.batch.sample_count,
                    target,
                    params: slot.overlay,
                },
            )?;
        }
        Ok(())
    }

    fn ensure_pipeline(&mut self, kind: PipelineKind) -> anyhow::Result<PipelineHandle> {
        let cached = match kind {
            PipelineKind::ToneMap => &mut self.tone_map_pipeline,
            PipelineKind::DebugOverlay => &mut self.overlay_pipeline,
            other => return Err(anyhow!("{:?} pipelines are owned by the integrator", other)),
        };
        if let Some(pipeline) = cached {
            return Ok(*pipeline);
        }
        let pipeline = self.backend.create_pipeline(kind)?;
        *cached = Some(pipeline);
        Ok(pipeline)
    }

    fn ensure_slot(&mut self) -> anyhow::Result<FrameSlot> {
        if self.slots.is_empty() {
            for slot in 0..self.settings.frames_in_flight {
                self.slots.push(FrameSlot {
                    tone_map: self.backend.create_buffer(&BufferDesc {
                        label: format!("Tone Map Params {}", slot),
                        size: std::mem::size_of::<ToneMapParams>() as u64,
                        kind: BufferKind::Uniform,
                    })?,
                    overlay: self.backend.create_buffer(&BufferDesc {
                        label: format!("Debug Overlay Params {}", slot),
                        size: std::mem::size_of::<DebugOverlayParams>() as u64,
                        kind: BufferKind::Uniform,
                    })?,
                });
            }
        }
        ensure!(!self.slots.is_empty(), "no frames in flight configured");
        Ok(self.slots[self.state.frame_slot() % self.slots.len()])
    }

    fn release_slots(&mut self) {
        for slot in self.slots.drain(..) {
            self.backend.destroy_buffer(slot.tone_map);
            self.backend.destroy_buffer(slot.overlay);
        }
    }

    fn ensure_capture_image(&mut self) -> anyhow::Result<ImageHandle> {
        if let Some(image) = self.capture_image {
            return Ok(image);
        }
        let image = self.backend.create_image(&ImageDesc {
            label: String::from("Capture Staging Image"),
            width: self.extent.0,
            height: self.extent.1,
            format: ImageFormat::Presentation,
        })?;
        self.capture_image = Some(image);
        Ok(image)
    }

    fn write_capture(&mut self, path: &Path) -> anyhow::Result<()> {
        let staging = self
            .capture_image
            .ok_or_else(|| anyhow!("capture staging image is missing"))?;
        let captured = self.backend.read_image(staging)?;
        let image = image::RgbaImage::from_raw(captured.width, captured.height, captured.pixels)
            .ok_or_else(|| anyhow!("captured pixel data does not match {}x{}", captured.width, captured.height))?;
        image
            .save(path)
            .with_context(|| format!("failed to write capture to {}", path.display()))?;
        log::info!("Captured frame to {}", path.display());
        Ok(())
    }

    /// Releases every GPU object owned by the renderer, its integrator and
    /// `scene`.
    pub fn release(&mut self, scene: &mut Scene) {
        self.clear_debug_views();
        self.release_slots();
        self.integrator.release(&mut self.backend);
        scene.release(&mut self.backend);
        if let Some(image) = self.capture_image.take() {
            self.backend.destroy_image(image);
        }
        self.tone_map_pipeline = None;
        self.overlay_pipeline = None;
    }
}

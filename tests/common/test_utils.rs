use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, bail, ensure};
use cgmath::{Deg, Vector3};
use trace_ngin::{
    config::RenderSettings,
    data_structures::{
        camera::CameraNode,
        light::PointLightNode,
        mesh::Mesh,
        scene_graph::{MeshNode, NodeId, NodeKind},
    },
    gpu::{
        AccelerationStructureBuild, AccelerationStructureHandle, Barrier, BufferDesc, BufferHandle,
        BufferKind, BuildMode, CapturedImage, CommandBufferHandle, DebugOverlayPass,
        DebugRayDispatch, DebugRayParams, GpuBackend, ImageDesc, ImageHandle, PipelineHandle,
        PipelineKind, Region, ToneMapParams, ToneMapPass, TraceDispatch, TraceParams,
    },
    render_state::RenderState,
    resources::{ResourceManager, cube_mesh_data},
    scene::{AccelerationUpdate, Scene, SceneState},
};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Everything a [`RecordingBackend`] was asked to record, in order.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Command {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    },
    Barrier(Barrier),
    Build {
        instance_count: u32,
        mode: BuildMode,
    },
    TraceRays {
        pipeline: PipelineKind,
        region: Region,
        params: TraceParams,
    },
    TraceDebugRays {
        ray_count: u32,
        params: DebugRayParams,
    },
    ToneMap {
        params: ToneMapParams,
    },
    DrawDebugRays {
        sample_count: u32,
    },
    CopyImage {
        src: ImageHandle,
        dst: ImageHandle,
    },
    Submit {
        present: Option<ImageHandle>,
    },
}

struct RecordedBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

/// In-memory backend that validates handles and records every command. Buffer
/// writes are kept so tests can decode the parameter blocks the core uploads.
pub(crate) struct RecordingBackend {
    next_handle: u32,
    buffers: HashMap<u32, RecordedBuffer>,
    images: HashMap<u32, ImageDesc>,
    structures: HashMap<u32, u32>,
    pipelines: HashMap<u32, PipelineKind>,
    commands: Vec<Command>,
    open: Option<CommandBufferHandle>,
    target: ImageHandle,
    target_extent: (u32, u32),
    out_of_date_frames: u32,
    pub(crate) frames_begun: Vec<usize>,
    pub(crate) fail_builds: bool,
    pub(crate) fail_tone_maps: bool,
}

impl RecordingBackend {
    pub(crate) fn new(extent: (u32, u32)) -> Self {
        Self {
            next_handle: 1,
            buffers: HashMap::new(),
            images: HashMap::new(),
            structures: HashMap::new(),
            pipelines: HashMap::new(),
            commands: Vec::new(),
            open: None,
            target: ImageHandle(0),
            target_extent: extent,
            out_of_date_frames: 0,
            frames_begun: Vec::new(),
            fail_builds: false,
            fail_tone_maps: false,
        }
    }

    fn handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn check_open(&self, cmd: CommandBufferHandle) -> anyhow::Result<()> {
        ensure!(self.open == Some(cmd), "command buffer {:?} is not recording", cmd);
        Ok(())
    }

    fn buffer(&self, buffer: BufferHandle) -> anyhow::Result<&RecordedBuffer> {
        self.buffers
            .get(&buffer.0)
            .ok_or_else(|| anyhow!("unknown buffer {:?}", buffer))
    }

    fn check_image(&self, image: ImageHandle) -> anyhow::Result<()> {
        ensure!(
            image == self.target || self.images.contains_key(&image.0),
            "unknown image {:?}",
            image
        );
        Ok(())
    }

    fn pipeline(&self, pipeline: PipelineHandle) -> anyhow::Result<PipelineKind> {
        self.pipelines
            .get(&pipeline.0)
            .copied()
            .ok_or_else(|| anyhow!("unknown pipeline {:?}", pipeline))
    }

    /// Makes the next `frames` target acquisitions report an out-of-date target.
    pub(crate) fn set_out_of_date(&mut self, frames: u32) {
        self.out_of_date_frames = frames;
    }

    pub(crate) fn target(&self) -> ImageHandle {
        self.target
    }

    pub(crate) fn target_extent(&self) -> (u32, u32) {
        self.target_extent
    }

    pub(crate) fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub(crate) fn builds(&self) -> Vec<(u32, BuildMode)> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Build {
                    instance_count,
                    mode,
                } => Some((*instance_count, *mode)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn trace_dispatches(&self) -> Vec<(PipelineKind, Region, TraceParams)> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::TraceRays {
                    pipeline,
                    region,
                    params,
                } => Some((*pipeline, *region, *params)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands.iter().filter(|c| predicate(c)).count()
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn live_buffers_of_kind(&self, kind: BufferKind) -> usize {
        self.buffers.values().filter(|b| b.desc.kind == kind).count()
    }

    pub(crate) fn live_images(&self) -> usize {
        self.images.len()
    }

    pub(crate) fn live_structures(&self) -> usize {
        self.structures.len()
    }

    pub(crate) fn image_desc(&self, image: ImageHandle) -> Option<&ImageDesc> {
        self.images.get(&image.0)
    }

    pub(crate) fn buffer_desc(&self, buffer: BufferHandle) -> Option<&BufferDesc> {
        self.buffers.get(&buffer.0).map(|b| &b.desc)
    }

    pub(crate) fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub(crate) fn pipelines_created(&self, kind: PipelineKind) -> usize {
        self.pipelines.values().filter(|k| **k == kind).count()
    }
}

impl GpuBackend for RecordingBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> anyhow::Result<BufferHandle> {
        ensure!(desc.size > 0, "buffer {} has zero size", desc.label);
        let handle = self.handle();
        self.buffers.insert(
            handle,
            RecordedBuffer {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(handle))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        assert!(self.buffers.remove(&buffer.0).is_some(), "double free of {:?}", buffer);
    }

    fn create_image(&mut self, desc: &ImageDesc) -> anyhow::Result<ImageHandle> {
        ensure!(desc.width > 0 && desc.height > 0, "image {} has zero area", desc.label);
        let handle = self.handle();
        self.images.insert(handle, desc.clone());
        Ok(ImageHandle(handle))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        assert!(self.images.remove(&image.0).is_some(), "double free of {:?}", image);
    }

    fn create_acceleration_structure(
        &mut self,
        max_instances: u32,
    ) -> anyhow::Result<AccelerationStructureHandle> {
        let handle = self.handle();
        self.structures.insert(handle, max_instances);
        Ok(AccelerationStructureHandle(handle))
    }

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructureHandle) {
        assert!(
            self.structures.remove(&structure.0).is_some(),
            "double free of {:?}",
            structure
        );
    }

    fn acceleration_structure_scratch_size(&self, max_instances: u32) -> u64 {
        max_instances as u64 * 64
    }

    fn create_pipeline(&mut self, kind: PipelineKind) -> anyhow::Result<PipelineHandle> {
        let handle = self.handle();
        self.pipelines.insert(handle, kind);
        Ok(PipelineHandle(handle))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let recorded = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| anyhow!("unknown buffer {:?}", buffer))?;
        let end = offset as usize + data.len();
        ensure!(
            end <= recorded.data.len(),
            "write of {} bytes at {} overflows {} ({} bytes)",
            data.len(),
            offset,
            recorded.desc.label,
            recorded.data.len()
        );
        recorded.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn begin_frame(&mut self, frame_slot: usize) -> anyhow::Result<CommandBufferHandle> {
        // an aborted frame leaves its command buffer open, it is dropped here
        let cmd = CommandBufferHandle(self.handle());
        self.open = Some(cmd);
        self.frames_begun.push(frame_slot);
        Ok(cmd)
    }

    fn acquire_target(&mut self) -> anyhow::Result<Option<ImageHandle>> {
        if self.out_of_date_frames > 0 {
            self.out_of_date_frames -= 1;
            return Ok(None);
        }
        if self.target == ImageHandle(0) {
            self.target = ImageHandle(self.handle());
        }
        Ok(Some(self.target))
    }

    fn resize_target(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.target_extent = (width, height);
        Ok(())
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> anyhow::Result<()> {
        self.check_open(cmd)?;
        let data = self.buffer(src)?.data[..size as usize].to_vec();
        let dst_buffer = self
            .buffers
            .get_mut(&dst.0)
            .ok_or_else(|| anyhow!("unknown buffer {:?}", dst))?;
        ensure!(size as usize <= dst_buffer.data.len(), "copy overflows {}", dst_buffer.desc.label);
        dst_buffer.data[..size as usize].copy_from_slice(&data);
        self.commands.push(Command::CopyBuffer { src, dst, size });
        Ok(())
    }

    fn cmd_barrier(&mut self, cmd: CommandBufferHandle, barrier: Barrier) -> anyhow::Result<()> {
        self.check_open(cmd)?;
        self.commands.push(Command::Barrier(barrier));
        Ok(())
    }

    fn cmd_build_acceleration_structure(
        &mut self,
        cmd: CommandBufferHandle,
        build: &AccelerationStructureBuild,
    ) -> anyhow::Result<()> {
        self.check_open(cmd)?;
        if self.fail_builds {
            bail!("acceleration structure build failed");
        }
        let capacity = self
            .structures
            .get(&build.structure.0)
            .copied()
            .ok_or_else(|| anyhow!("unknown structure {:?}", build.structure))?;
        ensure!(build.instance_count <= capacity, "build exceeds structure capacity");
        self.buffer(build.instances)?;
        self.buffer(build.scratch)?;
        self.commands.push(Command::Build {
            instance_count: build.instance_count,
            mode: build.mode,
        });
        Ok(())
    }

    fn cmd_trace_rays(&mut self, cmd: CommandBufferHandle, dispatch: &TraceDispatch) -> anyhow::Result<()> {
        self.check_open(cmd)?;
        let pipeline = self.pipeline(dispatch.pipeline)?;
        self.check_image(dispatch.accumulation)?;
        self.buffer(dispatch.lights)?;
        let data = &self.buffer(dispatch.params)?.data;
        let params: TraceParams =
            bytemuck::pod_read_unaligned(&data[..std::mem::size_of::<TraceParams>()]);
        self.commands.push(Command::TraceRays {
            pipeline,
            region: dispatch.region,
            params,
        });
        Ok(())
    }

    fn cmd_trace_debug_rays(
        &mut self,
        cmd: CommandBufferHandle,
        dispatch: &DebugRayDispatch,
    ) -> anyhow::Result<()> {
        self.check_open(cmd)?;
        self.pipeline(dispatch.pipeline)?;
        self.buffer(dispatch.output)?;
        let data = &self.buffer(dispatch.params)?.data;
        let params: DebugRayParams =
            bytemuck::pod_read_unaligned(&data[..std::mem::size_of::<DebugRayParams>()]);
        self.commands.push(Command::TraceDebugRays {
            ray_count: dispatch.ray_count,
            params,
        });
        Ok(())
    }

    fn cmd_tone_map(&mut self, cmd: CommandBufferHandle, pass: &ToneMapPass) -> anyhow::Result<()> {
        self.check_open(cmd)?;
        if self.fail_tone_maps {
            bail!("tone map pass failed");
        }
        self.pipeline(pass.pipeline)?;
        self.check_image(pass.source)?;
        self.check_image(pass.target)?;
        let data = &self.buffer(pass.params)?.data;
        let params: ToneMapParams =
            bytemuck::pod_read_unaligned(&data[..std::mem::size_of::<ToneMapParams>()]);
        self.commands.push(Command::ToneMap { params });
        Ok(())
    }

    fn cmd_draw_debug_rays(
        &mut self,
        cmd: CommandBufferHandle,
        pass: &DebugOverlayPass,
    ) -> anyhow::Result<()> {
        self.check_open(cmd)?;
        self.pipeline(pass.pipeline)?;
        self.buffer(pass.rays)?;
        self.buffer(pass.params)?;
        self.check_image(pass.target)?;
        self.commands.push(Command::DrawDebugRays {
            sample_count: pass.sample_count,
        });
        Ok(())
    }

    fn cmd_copy_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> anyhow::Result<()> {
        self.check_open(cmd)?;
        self.check_image(src)?;
        self.check_image(dst)?;
        self.commands.push(Command::CopyImage { src, dst });
        Ok(())
    }

    fn submit(&mut self, cmd: CommandBufferHandle, present: Option<ImageHandle>) -> anyhow::Result<()> {
        self.check_open(cmd)?;
        self.open = None;
        self.commands.push(Command::Submit { present });
        Ok(())
    }

    fn read_image(&mut self, image: ImageHandle) -> anyhow::Result<CapturedImage> {
        let desc = self
            .images
            .get(&image.0)
            .ok_or_else(|| anyhow!("unknown image {:?}", image))?;
        let pixels = [200u8, 100, 50, 255]
            .repeat((desc.width * desc.height) as usize);
        Ok(CapturedImage {
            width: desc.width,
            height: desc.height,
            pixels,
        })
    }
}

/// A scene with a camera, a point light and `cube_count` cubes grouped below
/// one transform node.
pub(crate) struct TestScene {
    pub(crate) scene: Scene,
    pub(crate) resources: ResourceManager,
    pub(crate) cube: Arc<Mesh>,
    pub(crate) camera: NodeId,
    pub(crate) light: NodeId,
    pub(crate) group: NodeId,
    pub(crate) cubes: Vec<NodeId>,
}

impl TestScene {
    pub(crate) fn new(cube_count: usize, settings: &RenderSettings) -> anyhow::Result<Self> {
        let mut resources = ResourceManager::new(settings.max_materials);
        let cube = resources.add_mesh(cube_mesh_data("cube"), None)?;
        let mut scene = Scene::new("root", settings.max_instances);
        let root = scene.root();
        let graph = scene.graph_mut();

        let camera = graph.spawn(
            root,
            "camera",
            NodeKind::Camera(CameraNode::new(Deg(60.0), 0.1, 100.0)),
        )?;
        graph.set_position(camera, Vector3::new(0.0, 0.0, 5.0))?;
        let light = graph.spawn(root, "light", NodeKind::PointLight(PointLightNode::default()))?;
        graph.set_position(light, Vector3::new(0.0, 4.0, 0.0))?;
        let group = graph.spawn(root, "cubes", NodeKind::Transform)?;

        let mut test_scene = Self {
            scene,
            resources,
            cube,
            camera,
            light,
            group,
            cubes: Vec::new(),
        };
        for _ in 0..cube_count {
            test_scene.add_cube()?;
        }
        Ok(test_scene)
    }

    pub(crate) fn add_cube(&mut self) -> anyhow::Result<NodeId> {
        let index = self.cubes.len();
        let name = format!("cube {}", index);
        let node = MeshNode::new(self.cube.clone()).with_instance_index(index as u32);
        let graph = self.scene.graph_mut();
        let id = graph.spawn(self.group, &name, NodeKind::Mesh(node))?;
        graph.set_position(id, Vector3::new(index as f32 * 1.5, 0.0, 0.0))?;
        self.cubes.push(id);
        Ok(id)
    }
}

/// Drives one frame of only the scene stages: traversal and the
/// acceleration-structure update.
pub(crate) struct SceneDriver {
    pub(crate) backend: RecordingBackend,
    pub(crate) state: RenderState,
    frame_index: u64,
}

impl SceneDriver {
    pub(crate) fn new(extent: (u32, u32)) -> Self {
        Self {
            backend: RecordingBackend::new(extent),
            state: RenderState::new(extent),
            frame_index: 0,
        }
    }

    pub(crate) fn frame(&mut self, scene: &mut Scene) -> anyhow::Result<(SceneState, AccelerationUpdate)> {
        let cmd = self.backend.begin_frame(0)?;
        let extent = self.backend.target_extent();
        self.state.begin_frame(self.frame_index, 0, extent, Some(cmd));
        let scene_state = scene.update(&mut self.state);
        let result = scene.update_acceleration_structure(&mut self.backend, &mut self.state);
        self.backend.submit(cmd, None)?;
        match result {
            Ok(_) => scene.end_frame(),
            Err(_) => scene.abort_frame(),
        }
        self.frame_index += 1;
        Ok((scene_state, result?))
    }

    /// Runs the scene stages and then `stage` inside one frame.
    pub(crate) fn frame_with<T>(
        &mut self,
        scene: &mut Scene,
        stage: impl FnOnce(&mut RecordingBackend, &RenderState) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let cmd = self.backend.begin_frame(0)?;
        let extent = self.backend.target_extent();
        self.state.begin_frame(self.frame_index, 0, extent, Some(cmd));
        scene.update(&mut self.state);
        scene.update_acceleration_structure(&mut self.backend, &mut self.state)?;
        let result = stage(&mut self.backend, &self.state);
        self.backend.submit(cmd, None)?;
        self.state.end_frame();
        scene.end_frame();
        self.frame_index += 1;
        result
    }

    /// Like [`SceneDriver::frame`] but leaves the render state populated so
    /// tests can inspect the gathered views.
    pub(crate) fn update_only(&mut self, scene: &mut Scene) -> SceneState {
        let extent = self.backend.target_extent();
        self.state.begin_frame(self.frame_index, 0, extent, None);
        self.frame_index += 1;
        scene.update(&mut self.state)
    }
}

pub(crate) fn assert_vec3_eq(actual: Vector3<f32>, expected: Vector3<f32>) {
    let diff = actual - expected;
    assert!(
        diff.x.abs() < 1e-4 && diff.y.abs() < 1e-4 && diff.z.abs() < 1e-4,
        "expected {:?}, got {:?}",
        expected,
        actual
    );
}

/// Settings small enough for tests to step through whole bakes.
pub(crate) fn small_settings() -> RenderSettings {
    RenderSettings {
        max_instances: 16,
        max_lights: 4,
        max_materials: 8,
        tile_size: 16,
        max_samples: 4,
        bounce_limit: 3,
        ..Default::default()
    }
}

//! [`GpuBackend`] on top of wgpu.
//!
//! wgpu exposes no hardware ray-tracing pipeline, so traversal runs in compute
//! shaders. The "acceleration structure" is a flat table of [`InstanceRaw`]
//! records that every ray tests against, and accumulation images are storage
//! buffers holding one `vec4<f32>` per pixel. wgpu tracks resource hazards
//! itself, so explicit barriers only show up in the trace log.
//!
//! Rays are intersected against each instance's object-space bounding box
//! only: mesh triangles are not uploaded, so every mesh renders as its
//! [`Aabb`](crate::data_structures::mesh::Aabb).
//!
//! The presentation target is always an offscreen texture owned by the
//! backend. With a window surface it is blitted to the swapchain on submit;
//! without one the backend renders headless.

use std::{collections::HashMap, time::Duration};

use anyhow::{Context as _, anyhow, bail, ensure};

use super::{
    AccelerationStructureBuild, AccelerationStructureHandle, Barrier, BufferDesc, BufferHandle,
    BufferKind, CapturedImage, CommandBufferHandle, DebugOverlayPass, DebugRayDispatch, GpuBackend,
    ImageDesc, ImageFormat, ImageHandle, InstanceRaw, PipelineHandle, PipelineKind, ToneMapPass,
    TraceDispatch,
};
use crate::context::{Context, TARGET_FORMAT};

const TRACE_WGSL: &str = concat!(
    include_str!("shaders/common.wgsl"),
    include_str!("shaders/path_trace.wgsl")
);
const DEBUG_RAYS_WGSL: &str = concat!(
    include_str!("shaders/common.wgsl"),
    include_str!("shaders/debug_rays.wgsl")
);
const TONE_MAP_WGSL: &str = include_str!("shaders/tone_map.wgsl");
const DEBUG_LINES_WGSL: &str = include_str!("shaders/debug_lines.wgsl");
const BLIT_WGSL: &str = include_str!("shaders/blit.wgsl");

/// Must match `@workgroup_size` of the trace kernels.
const WORKGROUP_SIZE: u32 = 8;
/// Must match `@workgroup_size` of the debug-ray kernel.
const DEBUG_WORKGROUP_SIZE: u32 = 64;
const POLL_TIMEOUT: Duration = Duration::from_secs(10);
const INSTANCE_SIZE: u64 = std::mem::size_of::<InstanceRaw>() as u64;

enum ImageEntry {
    /// HDR image stored as one `vec4<f32>` per pixel.
    Accumulation {
        buffer: wgpu::Buffer,
    },
    Texture {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
        width: u32,
        height: u32,
    },
}

enum PipelineEntry {
    Compute {
        pipeline: wgpu::ComputePipeline,
        layout: wgpu::BindGroupLayout,
    },
    Render {
        pipeline: wgpu::RenderPipeline,
        layout: wgpu::BindGroupLayout,
    },
}

struct StructureEntry {
    instances: wgpu::Buffer,
    instance_count: u32,
    capacity: u32,
}

struct Blit {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
}

pub struct WgpuBackend {
    context: Context,
    next_handle: u32,
    buffers: HashMap<u32, wgpu::Buffer>,
    images: HashMap<u32, ImageEntry>,
    pipelines: HashMap<u32, PipelineEntry>,
    structures: HashMap<u32, StructureEntry>,
    /// Open command encoders with the frame slot they belong to.
    encoders: HashMap<u32, (usize, wgpu::CommandEncoder)>,
    /// Last submission per frame-in-flight slot.
    submissions: Vec<Option<wgpu::SubmissionIndex>>,
    target: Option<ImageHandle>,
    /// Bound in place of the instance table when no structure exists yet.
    empty_instances: wgpu::Buffer,
    blit: Option<Blit>,
}

fn lookup<'a, T>(map: &'a HashMap<u32, T>, id: u32, what: &str) -> anyhow::Result<&'a T> {
    map.get(&id)
        .ok_or_else(|| anyhow!("unknown {} handle {}", what, id))
}

fn recording(
    encoders: &mut HashMap<u32, (usize, wgpu::CommandEncoder)>,
    cmd: CommandBufferHandle,
) -> anyhow::Result<&mut wgpu::CommandEncoder> {
    encoders
        .get_mut(&cmd.0)
        .map(|(_, encoder)| encoder)
        .ok_or_else(|| anyhow!("command buffer {} is not recording", cmd.0))
}

fn buffer_layout_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    ty: wgpu::BufferBindingType,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

const UNIFORM: wgpu::BufferBindingType = wgpu::BufferBindingType::Uniform;
const STORAGE_READ: wgpu::BufferBindingType = wgpu::BufferBindingType::Storage { read_only: true };
const STORAGE_WRITE: wgpu::BufferBindingType = wgpu::BufferBindingType::Storage { read_only: false };

fn bind_group(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    buffers: &[&wgpu::Buffer],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(binding, buffer)| wgpu::BindGroupEntry {
            binding: binding as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &entries,
    })
}

fn mk_render_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    layout: &wgpu::BindGroupLayout,
    format: wgpu::TextureFormat,
    topology: wgpu::PrimitiveTopology,
) -> wgpu::RenderPipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[Some(layout)],
        immediate_size: 0,
    });
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        cache: None,
        label: Some(label),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
    })
}

fn mk_compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    entry_point: &str,
    layout: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[Some(layout)],
        immediate_size: 0,
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

fn texture_copy(texture: &wgpu::Texture) -> wgpu::TexelCopyTextureInfo<'_> {
    wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: 0,
        origin: wgpu::Origin3d::ZERO,
        aspect: wgpu::TextureAspect::All,
    }
}

impl WgpuBackend {
    pub fn new(context: Context) -> anyhow::Result<Self> {
        let empty_instances = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Empty Instance Table"),
            size: INSTANCE_SIZE,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let blit = context.surface.as_ref().map(|target| {
            let layout = context
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("blit_bind_group_layout"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                multisampled: false,
                                view_dimension: wgpu::TextureViewDimension::D2,
                                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 1,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                            count: None,
                        },
                    ],
                });
            let pipeline = mk_render_pipeline(
                &context.device,
                "Present Blit",
                BLIT_WGSL,
                &layout,
                target.config.format,
                wgpu::PrimitiveTopology::TriangleList,
            );
            let sampler = context.device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("Present Blit Sampler"),
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                ..Default::default()
            });
            Blit {
                pipeline,
                layout,
                sampler,
            }
        });

        let mut backend = Self {
            context,
            next_handle: 1,
            buffers: HashMap::new(),
            images: HashMap::new(),
            pipelines: HashMap::new(),
            structures: HashMap::new(),
            encoders: HashMap::new(),
            submissions: Vec::new(),
            target: None,
            empty_instances,
            blit,
        };
        let (width, height) = backend.context.extent();
        backend.recreate_target(width, height)?;
        Ok(backend)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn allocate_handle(&mut self) -> u32 {
        let id = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        id
    }

    fn recreate_target(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if let Some(target) = self.target.take() {
            self.destroy_image(target);
        }
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.target = Some(self.create_image(&ImageDesc {
            label: String::from("Presentation Target"),
            width,
            height,
            format: ImageFormat::Presentation,
        })?);
        Ok(())
    }

    fn wait_for(&self, submission: wgpu::SubmissionIndex) -> anyhow::Result<()> {
        self.context
            .device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: Some(POLL_TIMEOUT),
            })
            .map_err(|e| anyhow!("waiting for GPU submission failed: {:?}", e))?;
        Ok(())
    }

    fn blit_to_surface(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        present: ImageHandle,
    ) -> anyhow::Result<Option<wgpu::SurfaceTexture>> {
        let (Some(surface), Some(blit)) = (self.context.surface.as_ref(), self.blit.as_ref()) else {
            return Ok(None);
        };
        let frame = match surface.surface.get_current_texture() {
            wgpu::CurrentSurfaceTexture::Success(frame)
            | wgpu::CurrentSurfaceTexture::Suboptimal(frame) => frame,
            wgpu::CurrentSurfaceTexture::Lost | wgpu::CurrentSurfaceTexture::Outdated => {
                log::warn!("Surface lost or outdated, reconfiguring");
                self.context.reconfigure_surface();
                return Ok(None);
            }
            e => return Err(anyhow!("failed to acquire surface texture: {:?}", e)),
        };
        let source = match lookup(&self.images, present.0, "image")? {
            ImageEntry::Texture { view, .. } => view,
            ImageEntry::Accumulation { .. } => bail!("image {} cannot be presented", present.0),
        };
        let group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("present_blit_bind_group"),
                layout: &blit.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(source),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&blit.sampler),
                    },
                ],
            });
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Present Blit Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                multiview_mask: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&blit.pipeline);
            pass.set_bind_group(0, &group, &[]);
            pass.draw(0..3, 0..1);
        }
        Ok(Some(frame))
    }
}

impl GpuBackend for WgpuBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> anyhow::Result<BufferHandle> {
        let usage = match desc.kind {
            BufferKind::InstanceStaging => wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            BufferKind::InstanceDevice => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
            }
            BufferKind::Scratch | BufferKind::DebugRays => wgpu::BufferUsages::STORAGE,
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            BufferKind::Storage => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        };
        ensure!(
            desc.size <= self.context.device.limits().max_buffer_size,
            "buffer {} of {} bytes exceeds the device limit",
            desc.label,
            desc.size
        );
        let buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            // storage bindings need a non-zero, 16 byte aligned size
            size: desc.size.max(16).next_multiple_of(16),
            usage,
            mapped_at_creation: false,
        });
        let id = self.allocate_handle();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&buffer.0) {
            buffer.destroy();
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> anyhow::Result<ImageHandle> {
        ensure!(
            desc.width > 0 && desc.height > 0,
            "image {} has zero extent",
            desc.label
        );
        let entry = match desc.format {
            ImageFormat::Rgba32Float => ImageEntry::Accumulation {
                buffer: self.context.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&desc.label),
                    size: desc.width as u64 * desc.height as u64 * 16,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
            },
            ImageFormat::Presentation => {
                let texture = self.context.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&desc.label),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: TARGET_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                ImageEntry::Texture {
                    texture,
                    view,
                    width: desc.width,
                    height: desc.height,
                }
            }
        };
        let id = self.allocate_handle();
        self.images.insert(id, entry);
        Ok(ImageHandle(id))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        match self.images.remove(&image.0) {
            Some(ImageEntry::Accumulation { buffer }) => buffer.destroy(),
            Some(ImageEntry::Texture { texture, .. }) => texture.destroy(),
            None => (),
        }
    }

    fn create_acceleration_structure(
        &mut self,
        max_instances: u32,
    ) -> anyhow::Result<AccelerationStructureHandle> {
        let instances = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Instance Table"),
            size: INSTANCE_SIZE * max_instances.max(1) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let id = self.allocate_handle();
        self.structures.insert(
            id,
            StructureEntry {
                instances,
                instance_count: 0,
                capacity: max_instances,
            },
        );
        Ok(AccelerationStructureHandle(id))
    }

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructureHandle) {
        if let Some(entry) = self.structures.remove(&structure.0) {
            entry.instances.destroy();
        }
    }

    fn acceleration_structure_scratch_size(&self, _max_instances: u32) -> u64 {
        // the instance table is traversed linearly and needs no scratch memory
        0
    }

    fn create_pipeline(&mut self, kind: PipelineKind) -> anyhow::Result<PipelineHandle> {
        let device = &self.context.device;
        let compute_layout = |label: &str, entries: &[wgpu::BindGroupLayoutEntry]| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries,
            })
        };
        let compute = wgpu::ShaderStages::COMPUTE;
        let entry = match kind {
            PipelineKind::PathTrace | PipelineKind::Preview => {
                let layout = compute_layout(
                    "trace_bind_group_layout",
                    &[
                        buffer_layout_entry(0, compute, UNIFORM),
                        buffer_layout_entry(1, compute, STORAGE_READ),
                        buffer_layout_entry(2, compute, STORAGE_READ),
                        buffer_layout_entry(3, compute, STORAGE_WRITE),
                    ],
                );
                let entry_point = if kind == PipelineKind::PathTrace {
                    "trace_main"
                } else {
                    "preview_main"
                };
                PipelineEntry::Compute {
                    pipeline: mk_compute_pipeline(device, "Path Trace", TRACE_WGSL, entry_point, &layout),
                    layout,
                }
            }
            PipelineKind::DebugRays => {
                let layout = compute_layout(
                    "debug_rays_bind_group_layout",
                    &[
                        buffer_layout_entry(0, compute, UNIFORM),
                        buffer_layout_entry(1, compute, STORAGE_READ),
                        buffer_layout_entry(2, compute, STORAGE_WRITE),
                    ],
                );
                PipelineEntry::Compute {
                    pipeline: mk_compute_pipeline(device, "Debug Rays", DEBUG_RAYS_WGSL, "debug_main", &layout),
                    layout,
                }
            }
            PipelineKind::ToneMap => {
                let fragment = wgpu::ShaderStages::FRAGMENT;
                let layout = compute_layout(
                    "tone_map_bind_group_layout",
                    &[
                        buffer_layout_entry(0, fragment, UNIFORM),
                        buffer_layout_entry(1, fragment, STORAGE_READ),
                    ],
                );
                PipelineEntry::Render {
                    pipeline: mk_render_pipeline(
                        device,
                        "Tone Map",
                        TONE_MAP_WGSL,
                        &layout,
                        TARGET_FORMAT,
                        wgpu::PrimitiveTopology::TriangleList,
                    ),
                    layout,
                }
            }
            PipelineKind::DebugOverlay => {
                let vertex = wgpu::ShaderStages::VERTEX;
                let layout = compute_layout(
                    "debug_lines_bind_group_layout",
                    &[
                        buffer_layout_entry(0, vertex, UNIFORM),
                        buffer_layout_entry(1, vertex, STORAGE_READ),
                    ],
                );
                PipelineEntry::Render {
                    pipeline: mk_render_pipeline(
                        device,
                        "Debug Lines",
                        DEBUG_LINES_WGSL,
                        &layout,
                        TARGET_FORMAT,
                        wgpu::PrimitiveTopology::LineList,
                    ),
                    layout,
                }
            }
        };
        let id = self.allocate_handle();
        self.pipelines.insert(id, entry);
        log::debug!("Created {:?} pipeline {}", kind, id);
        Ok(PipelineHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let buffer = lookup(&self.buffers, buffer.0, "buffer")?;
        self.context.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn begin_frame(&mut self, frame_slot: usize) -> anyhow::Result<CommandBufferHandle> {
        if self.submissions.len() <= frame_slot {
            self.submissions.resize(frame_slot + 1, None);
        }
        if let Some(submission) = self.submissions[frame_slot].take() {
            self.wait_for(submission)?;
        }
        let stale: Vec<u32> = self
            .encoders
            .iter()
            .filter(|(_, (slot, _))| *slot == frame_slot)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            log::warn!("Dropping unsubmitted command buffer {} of slot {}", id, frame_slot);
            self.encoders.remove(&id);
        }
        let encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });
        let id = self.allocate_handle();
        self.encoders.insert(id, (frame_slot, encoder));
        Ok(CommandBufferHandle(id))
    }

    fn acquire_target(&mut self) -> anyhow::Result<Option<ImageHandle>> {
        Ok(self.target)
    }

    fn resize_target(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.context.resize(width, height);
        self.recreate_target(width, height)
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> anyhow::Result<()> {
        let encoder = recording(&mut self.encoders, cmd)?;
        let src = lookup(&self.buffers, src.0, "buffer")?;
        let dst = lookup(&self.buffers, dst.0, "buffer")?;
        encoder.copy_buffer_to_buffer(src, 0, dst, 0, size);
        Ok(())
    }

    fn cmd_barrier(&mut self, cmd: CommandBufferHandle, barrier: Barrier) -> anyhow::Result<()> {
        recording(&mut self.encoders, cmd)?;
        log::trace!("{:?} on command buffer {} is tracked by wgpu", barrier, cmd.0);
        Ok(())
    }

    fn cmd_build_acceleration_structure(
        &mut self,
        cmd: CommandBufferHandle,
        build: &AccelerationStructureBuild,
    ) -> anyhow::Result<()> {
        let encoder = recording(&mut self.encoders, cmd)?;
        let source = lookup(&self.buffers, build.instances.0, "buffer")?;
        let structure = self
            .structures
            .get_mut(&build.structure.0)
            .ok_or_else(|| anyhow!("unknown acceleration structure handle {}", build.structure.0))?;
        ensure!(
            build.instance_count <= structure.capacity,
            "{} instances exceed the structure capacity of {}",
            build.instance_count,
            structure.capacity
        );
        if build.instance_count > 0 {
            encoder.copy_buffer_to_buffer(
                source,
                0,
                &structure.instances,
                0,
                INSTANCE_SIZE * build.instance_count as u64,
            );
        }
        structure.instance_count = build.instance_count;
        log::trace!(
            "{:?} of instance table {} with {} instances",
            build.mode,
            build.structure.0,
            build.instance_count
        );
        Ok(())
    }

    fn cmd_trace_rays(&mut self, cmd: CommandBufferHandle, dispatch: &TraceDispatch) -> anyhow::Result<()> {
        let encoder = recording(&mut self.encoders, cmd)?;
        let PipelineEntry::Compute { pipeline, layout } =
            lookup(&self.pipelines, dispatch.pipeline.0, "pipeline")?
        else {
            bail!("pipeline {} is not a ray dispatch pipeline", dispatch.pipeline.0);
        };
        let instances = match dispatch.structure {
            Some(structure) => &lookup(&self.structures, structure.0, "acceleration structure")?.instances,
            None => &self.empty_instances,
        };
        let ImageEntry::Accumulation { buffer: accumulation } =
            lookup(&self.images, dispatch.accumulation.0, "image")?
        else {
            bail!("image {} is not an accumulation image", dispatch.accumulation.0);
        };
        let group = bind_group(
            &self.context.device,
            "trace_bind_group",
            layout,
            &[
                lookup(&self.buffers, dispatch.params.0, "buffer")?,
                instances,
                lookup(&self.buffers, dispatch.lights.0, "buffer")?,
                accumulation,
            ],
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Trace Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &group, &[]);
        pass.dispatch_workgroups(
            dispatch.region.width.div_ceil(WORKGROUP_SIZE),
            dispatch.region.height.div_ceil(WORKGROUP_SIZE),
            1,
        );
        Ok(())
    }

    fn cmd_trace_debug_rays(
        &mut self,
        cmd: CommandBufferHandle,
        dispatch: &DebugRayDispatch,
    ) -> anyhow::Result<()> {
        let encoder = recording(&mut self.encoders, cmd)?;
        let PipelineEntry::Compute { pipeline, layout } =
            lookup(&self.pipelines, dispatch.pipeline.0, "pipeline")?
        else {
            bail!("pipeline {} is not a ray dispatch pipeline", dispatch.pipeline.0);
        };
        let instances = match dispatch.structure {
            Some(structure) => &lookup(&self.structures, structure.0, "acceleration structure")?.instances,
            None => &self.empty_instances,
        };
        let group = bind_group(
            &self.context.device,
            "debug_rays_bind_group",
            layout,
            &[
                lookup(&self.buffers, dispatch.params.0, "buffer")?,
                instances,
                lookup(&self.buffers, dispatch.output.0, "buffer")?,
            ],
        );
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Debug Ray Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &group, &[]);
        pass.dispatch_workgroups(dispatch.ray_count.div_ceil(DEBUG_WORKGROUP_SIZE), 1, 1);
        Ok(())
    }

    fn cmd_tone_map(&mut self, cmd: CommandBufferHandle, tone_map: &ToneMapPass) -> anyhow::Result<()> {
        let encoder = recording(&mut self.encoders, cmd)?;
        let PipelineEntry::Render { pipeline, layout } =
            lookup(&self.pipelines, tone_map.pipeline.0, "pipeline")?
        else {
            bail!("pipeline {} is not a tone map pipeline", tone_map.pipeline.0);
        };
        let ImageEntry::Accumulation { buffer: source } = lookup(&self.images, tone_map.source.0, "image")?
        else {
            bail!("image {} is not an accumulation image", tone_map.source.0);
        };
        let ImageEntry::Texture { view, .. } = lookup(&self.images, tone_map.target.0, "image")? else {
            bail!("image {} is not a render target", tone_map.target.0);
        };
        let group = bind_group(
            &self.context.device,
            "tone_map_bind_group",
            layout,
            &[lookup(&self.buffers, tone_map.params.0, "buffer")?, source],
        );
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Tone Map Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            multiview_mask: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &group, &[]);
        pass.draw(0..3, 0..1);
        Ok(())
    }

    fn cmd_draw_debug_rays(
        &mut self,
        cmd: CommandBufferHandle,
        overlay: &DebugOverlayPass,
    ) -> anyhow::Result<()> {
        let encoder = recording(&mut self.encoders, cmd)?;
        let PipelineEntry::Render { pipeline, layout } =
            lookup(&self.pipelines, overlay.pipeline.0, "pipeline")?
        else {
            bail!("pipeline {} is not an overlay pipeline", overlay.pipeline.0);
        };
        let ImageEntry::Texture { view, .. } = lookup(&self.images, overlay.target.0, "image")? else {
            bail!("image {} is not a render target", overlay.target.0);
        };
        let group = bind_group(
            &self.context.device,
            "debug_lines_bind_group",
            layout,
            &[
                lookup(&self.buffers, overlay.params.0, "buffer")?,
                lookup(&self.buffers, overlay.rays.0, "buffer")?,
            ],
        );
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Debug Overlay Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            multiview_mask: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &group, &[]);
        pass.draw(0..overlay.sample_count * 2, 0..1);
        Ok(())
    }

    fn cmd_copy_image(
        &mut self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
    ) -> anyhow::Result<()> {
        let encoder = recording(&mut self.encoders, cmd)?;
        let (
            ImageEntry::Texture {
                texture: source,
                width: src_width,
                height: src_height,
                ..
            },
            ImageEntry::Texture {
                texture: destination,
                width: dst_width,
                height: dst_height,
                ..
            },
        ) = (
            lookup(&self.images, src.0, "image")?,
            lookup(&self.images, dst.0, "image")?,
        )
        else {
            bail!("only presentation images can be copied");
        };
        encoder.copy_texture_to_texture(
            texture_copy(source),
            texture_copy(destination),
            wgpu::Extent3d {
                width: (*src_width).min(*dst_width),
                height: (*src_height).min(*dst_height),
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn submit(&mut self, cmd: CommandBufferHandle, present: Option<ImageHandle>) -> anyhow::Result<()> {
        let (slot, mut encoder) = self
            .encoders
            .remove(&cmd.0)
            .ok_or_else(|| anyhow!("command buffer {} is not recording", cmd.0))?;
        let frame = match present {
            Some(image) => self.blit_to_surface(&mut encoder, image)?,
            None => None,
        };
        let submission = self.context.queue.submit(Some(encoder.finish()));
        if let Some(entry) = self.submissions.get_mut(slot) {
            *entry = Some(submission);
        }
        if let Some(frame) = frame {
            if let Some(window) = self.context.window() {
                window.pre_present_notify();
            }
            frame.present();
        }
        Ok(())
    }

    fn read_image(&mut self, image: ImageHandle) -> anyhow::Result<CapturedImage> {
        let ImageEntry::Texture {
            texture,
            width,
            height,
            ..
        } = lookup(&self.images, image.0, "image")?
        else {
            bail!("image {} has no displayable format", image.0);
        };
        let (width, height) = (*width, *height);
        let unpadded_row = width * 4;
        let padded_row = unpadded_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let device = &self.context.device;
        let output = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Capture Readback Buffer"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Capture Encoder"),
        });
        encoder.copy_texture_to_buffer(
            texture_copy(texture),
            wgpu::TexelCopyBufferInfo {
                buffer: &output,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        let submission = self.context.queue.submit(Some(encoder.finish()));

        // The mapping has to be requested before polling or the wait never resolves.
        let slice = output.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait_for(submission)?;
        futures::executor::block_on(rx.receive())
            .ok_or_else(|| anyhow!("capture readback was cancelled"))?
            .context("failed to map capture buffer")?;

        let pixels = {
            let data = slice.get_mapped_range();
            let mut pixels = Vec::with_capacity((unpadded_row * height) as usize);
            for row in data.chunks(padded_row as usize) {
                pixels.extend_from_slice(&row[..unpadded_row as usize]);
            }
            pixels
        };
        output.unmap();
        Ok(CapturedImage {
            width,
            height,
            pixels,
        })
    }
}

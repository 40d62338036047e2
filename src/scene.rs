//! The scene: the node graph plus the top-level acceleration structure that
//! mirrors its mesh instances on the GPU.
//!
//! Each frame [`Scene::update`] traverses the graph into a [`RenderState`] and
//! classifies the frame as [`SceneState::Ready`], [`SceneState::TransformsUpdated`]
//! or [`SceneState::HierarchyUpdated`]. [`Scene::update_acceleration_structure`]
//! then turns that classification into nothing, an in-place update, or a full
//! (re)build.

use anyhow::{anyhow, ensure};

use crate::{
    data_structures::scene_graph::{NodeId, SceneGraph},
    gpu::{
        AccelerationStructureBuild, AccelerationStructureHandle, Barrier, BufferDesc, BufferHandle,
        BufferKind, BuildMode, GpuBackend, InstanceRaw,
    },
    render_state::RenderState,
};

/// Coarsest invalidation observed during a frame. Variants are ordered from
/// finest to coarsest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SceneState {
    /// Nothing changed.
    #[default]
    Ready,
    /// Only transforms changed; instance count and topology are unchanged.
    TransformsUpdated,
    /// Nodes were added, removed, enabled or disabled.
    HierarchyUpdated,
}

/// What the acceleration-structure stage did this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelerationUpdate {
    Skipped,
    /// First build of the structure.
    Built,
    /// Full rebuild of an existing structure.
    Rebuilt,
    /// In-place update of an existing structure.
    Updated,
}

/// GPU objects backing the top-level acceleration structure. All buffers are
/// sized for `capacity` instances and created lazily on the first build.
#[derive(Debug, Default)]
pub struct AccelerationStructureData {
    structure: Option<AccelerationStructureHandle>,
    staging: Option<BufferHandle>,
    instances: Option<BufferHandle>,
    scratch: Option<BufferHandle>,
    built: bool,
    instance_count: u32,
    capacity: u32,
    /// `(built, instance_count)` before this frame's recorded build, until the
    /// frame is submitted.
    uncommitted: Option<(bool, u32)>,
}

impl AccelerationStructureData {
    pub fn structure(&self) -> Option<AccelerationStructureHandle> {
        self.structure
    }

    pub fn staging_buffer(&self) -> Option<BufferHandle> {
        self.staging
    }

    pub fn instance_buffer(&self) -> Option<BufferHandle> {
        self.instances
    }

    pub fn scratch_buffer(&self) -> Option<BufferHandle> {
        self.scratch
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn is_allocated(&self) -> bool {
        self.structure.is_some()
    }

    fn allocate(&mut self, backend: &mut dyn GpuBackend, capacity: u32) -> anyhow::Result<()> {
        let record_size = std::mem::size_of::<InstanceRaw>() as u64;
        let instance_bytes = record_size * capacity as u64;
        self.structure = Some(backend.create_acceleration_structure(capacity)?);
        self.staging = Some(backend.create_buffer(&BufferDesc {
            label: String::from("TLAS Instance Staging Buffer"),
            size: instance_bytes,
            kind: BufferKind::InstanceStaging,
        })?);
        self.instances = Some(backend.create_buffer(&BufferDesc {
            label: String::from("TLAS Instance Buffer"),
            size: instance_bytes,
            kind: BufferKind::InstanceDevice,
        })?);
        self.scratch = Some(backend.create_buffer(&BufferDesc {
            label: String::from("TLAS Scratch Buffer"),
            size: backend.acceleration_structure_scratch_size(capacity).max(1),
            kind: BufferKind::Scratch,
        })?);
        self.capacity = capacity;
        log::debug!("Allocated acceleration structure for {} instances", capacity);
        Ok(())
    }

    /// Releases all GPU objects; the next build starts from scratch.
    pub fn release(&mut self, backend: &mut dyn GpuBackend) {
        if let Some(structure) = self.structure.take() {
            backend.destroy_acceleration_structure(structure);
        }
        for buffer in [self.staging.take(), self.instances.take(), self.scratch.take()]
            .into_iter()
            .flatten()
        {
            backend.destroy_buffer(buffer);
        }
        self.built = false;
        self.instance_count = 0;
        self.uncommitted = None;
    }
}

#[derive(Debug)]
pub struct Scene {
    graph: SceneGraph,
    acceleration: AccelerationStructureData,
    state: SceneState,
    active_camera: Option<NodeId>,
    max_instances: u32,
    release_pending: bool,
}

impl Scene {
    pub fn new(root_name: &str, max_instances: u32) -> Self {
        Self {
            graph: SceneGraph::new(root_name),
            acceleration: AccelerationStructureData::default(),
            state: SceneState::Ready,
            active_camera: None,
            max_instances,
            release_pending: false,
        }
    }

    pub fn graph(&self) -> &SceneGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut SceneGraph {
        &mut self.graph
    }

    pub fn root(&self) -> NodeId {
        self.graph.root()
    }

    pub fn state(&self) -> SceneState {
        self.state
    }

    pub fn acceleration_structure(&self) -> &AccelerationStructureData {
        &self.acceleration
    }

    pub fn max_instances(&self) -> u32 {
        self.max_instances
    }

    /// Changes the instance capacity. Existing buffers are released on the
    /// next acceleration-structure stage and the next frame is forced to be a
    /// hierarchy change so the structure gets rebuilt at the new size.
    pub fn set_max_instances(&mut self, max_instances: u32) {
        if max_instances == self.max_instances {
            return;
        }
        self.max_instances = max_instances;
        self.release_pending = true;
        self.graph.invalidate_hierarchy();
    }

    /// Picks the camera published to the render state. `None` selects the
    /// first enabled camera in traversal order.
    pub fn set_active_camera(&mut self, camera: Option<NodeId>) {
        self.active_camera = camera;
    }

    pub fn active_camera(&self) -> Option<NodeId> {
        self.active_camera
    }

    /// Traverses the graph into `state` and classifies the frame.
    pub fn update(&mut self, state: &mut RenderState) -> SceneState {
        state.preferred_camera = self.active_camera;
        self.state = self.graph.traverse(state);
        state.resolve_camera();
        state.scene_state = self.state;
        log::trace!(
            "Scene update: {:?}, {} mesh instances, {} lights",
            self.state,
            state.meshes().len(),
            state.light_count()
        );
        self.state
    }

    /// Builds, rebuilds or updates the top-level acceleration structure as the
    /// frame's classification requires and publishes its handle to `state`.
    ///
    /// Exceeding the instance capacity fails before any command is recorded.
    pub fn update_acceleration_structure(
        &mut self,
        backend: &mut dyn GpuBackend,
        state: &mut RenderState,
    ) -> anyhow::Result<AccelerationUpdate> {
        let instance_count = state.meshes().len();
        ensure!(
            instance_count <= self.max_instances as usize,
            "scene has {} mesh instances but the acceleration structure holds at most {}",
            instance_count,
            self.max_instances
        );
        if self.release_pending {
            self.acceleration.release(backend);
            self.release_pending = false;
        }

        // an in-place update requires the instance count of the last build
        let count_changed = instance_count as u32 != self.acceleration.instance_count;
        let mode = match (state.scene_state(), self.acceleration.built) {
            (SceneState::HierarchyUpdated, false) if instance_count == 0 => None,
            (SceneState::HierarchyUpdated, _) => Some(BuildMode::Build),
            (_, true) if count_changed => Some(BuildMode::Build),
            (SceneState::TransformsUpdated, true) => Some(BuildMode::Update),
            (SceneState::TransformsUpdated, false) | (SceneState::Ready, _) => None,
        };
        let Some(mode) = mode else {
            state.acceleration_structure = self.built_structure();
            return Ok(AccelerationUpdate::Skipped);
        };

        let cmd = state
            .command_buffer()
            .ok_or_else(|| anyhow!("render state has no active command buffer"))?;
        if !self.acceleration.is_allocated() {
            self.acceleration.allocate(backend, self.max_instances)?;
        }
        let (Some(structure), Some(staging), Some(instances), Some(scratch)) = (
            self.acceleration.structure,
            self.acceleration.staging,
            self.acceleration.instances,
            self.acceleration.scratch,
        ) else {
            return Err(anyhow!("acceleration structure buffers are missing"));
        };

        let records: Vec<InstanceRaw> = state.meshes().iter().map(InstanceRaw::from_instance).collect();
        let bytes: &[u8] = bytemuck::cast_slice(&records);
        if !bytes.is_empty() {
            backend.write_buffer(staging, 0, bytes)?;
            backend.cmd_copy_buffer(cmd, staging, instances, bytes.len() as u64)?;
        }
        backend.cmd_barrier(cmd, Barrier::TransferToAccelerationBuild)?;
        backend.cmd_build_acceleration_structure(
            cmd,
            &AccelerationStructureBuild {
                structure,
                instances,
                instance_count: instance_count as u32,
                scratch,
                mode,
            },
        )?;
        backend.cmd_barrier(cmd, Barrier::AccelerationBuildToTrace)?;

        let outcome = match (mode, self.acceleration.built) {
            (BuildMode::Build, false) => AccelerationUpdate::Built,
            (BuildMode::Build, true) => AccelerationUpdate::Rebuilt,
            (BuildMode::Update, _) => AccelerationUpdate::Updated,
        };
        self.acceleration
            .uncommitted
            .get_or_insert((self.acceleration.built, self.acceleration.instance_count));
        self.acceleration.built = true;
        self.acceleration.instance_count = instance_count as u32;
        state.acceleration_structure = Some(structure);
        log::debug!("Acceleration structure {:?} with {} instances", outcome, instance_count);
        Ok(outcome)
    }

    fn built_structure(&self) -> Option<AccelerationStructureHandle> {
        self.acceleration
            .built
            .then_some(self.acceleration.structure)
            .flatten()
    }

    /// Ends a submitted frame: the recorded build becomes the structure's
    /// state and per-frame node data is dropped.
    pub fn end_frame(&mut self) {
        self.acceleration.uncommitted = None;
        self.graph.mid_frame_cleanup();
    }

    /// Ends a frame whose commands were never submitted. A build recorded
    /// during the frame is forgotten, and a frame that consumed dirty flags
    /// forces the next frame to be a hierarchy change so nothing is lost.
    pub fn abort_frame(&mut self) {
        let rolled_back = match self.acceleration.uncommitted.take() {
            Some((built, instance_count)) => {
                self.acceleration.built = built;
                self.acceleration.instance_count = instance_count;
                true
            }
            None => false,
        };
        if rolled_back || self.state != SceneState::Ready {
            log::debug!("Frame aborted, the next frame rebuilds the acceleration structure");
            self.graph.invalidate_hierarchy();
        }
        self.graph.mid_frame_cleanup();
    }

    /// Releases GPU objects owned by the scene.
    pub fn release(&mut self, backend: &mut dyn GpuBackend) {
        self.acceleration.release(backend);
    }
}

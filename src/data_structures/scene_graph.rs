//! Scene graph and hierarchical scene organization.
//!
//! Nodes live in an arena and refer to each other through generational
//! [`NodeId`] handles, so a handle to a removed node can never alias a newer
//! node in the same slot. Each node carries a [`TransformNode`] plus a
//! [`NodeKind`] payload; per-kind behaviour is dispatched through the
//! [`NodeBehavior`] capability trait.
//!
//! Dirty tracking works on two levels:
//!
//! - *hierarchy dirty* is set on a subtree root whenever the topology or the
//!   set of enabled nodes changes (attach, detach, remove, enable, disable)
//! - *transform dirty* is set on a node and its whole subtree whenever a local
//!   transform changes
//!
//! [`SceneGraph::traverse`] consumes both flags exactly once per frame and
//! reports the coarsest change it observed.

use std::sync::Arc;

use anyhow::{anyhow, bail, ensure};
use cgmath::{Matrix4, Quaternion, Rad, SquareMatrix, Vector3};

use crate::{
    data_structures::{
        camera::CameraNode,
        light::{DirectionalLightNode, IblNode, PointLightNode, SpotLightNode},
        mesh::{Material, Mesh},
        transform::TransformNode,
    },
    render_state::{MeshInstance, RenderState},
    scene::SceneState,
};

/// Stable handle to a node in a [`SceneGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Read-only view of a node handed to [`NodeBehavior::update`].
pub struct NodeContext<'a> {
    pub id: NodeId,
    pub name: &'a str,
    pub transform: &'a TransformNode,
}

/// Capability interface implemented by every node variant.
pub trait NodeBehavior {
    /// Called once per frame when the node is visited, after its transform is
    /// up to date. Implementations publish their per-frame view into `state`.
    fn update(&mut self, node: NodeContext<'_>, state: &mut RenderState);

    /// Drops data that was only valid for the frame that just ended.
    fn mid_frame_cleanup(&mut self) {}
}

/// A mesh placed in the scene.
#[derive(Clone, Debug)]
pub struct MeshNode {
    pub mesh: Arc<Mesh>,
    pub material_override: Option<Arc<Material>>,
    /// Per-instance index forwarded to the shaders.
    pub instance_index: u32,
    instance_slot: Option<usize>,
}

impl MeshNode {
    pub fn new(mesh: Arc<Mesh>) -> Self {
        Self {
            mesh,
            material_override: None,
            instance_index: 0,
            instance_slot: None,
        }
    }

    pub fn with_material(mut self, material: Arc<Material>) -> Self {
        self.material_override = Some(material);
        self
    }

    pub fn with_instance_index(mut self, instance_index: u32) -> Self {
        self.instance_index = instance_index;
        self
    }

    /// Material used for rendering: the override if present, else the mesh's own.
    pub fn material(&self) -> Option<&Arc<Material>> {
        self.material_override.as_ref().or(self.mesh.material.as_ref())
    }

    /// Index of this node's record in the current frame's instance list.
    pub fn instance_slot(&self) -> Option<usize> {
        self.instance_slot
    }
}

impl NodeBehavior for MeshNode {
    fn update(&mut self, node: NodeContext<'_>, state: &mut RenderState) {
        self.instance_slot = Some(state.meshes.len());
        state.meshes.push(MeshInstance {
            node: node.id,
            mesh: self.mesh.id,
            material: self.material().map(|m| m.id),
            custom_index: self.instance_index,
            bounds: self.mesh.bounds,
            model: node.transform.model_matrix(),
            previous_model: node.transform.previous_model_matrix(),
        });
    }

    fn mid_frame_cleanup(&mut self) {
        self.instance_slot = None;
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Transform,
    Mesh(MeshNode),
    Camera(CameraNode),
    DirectionalLight(DirectionalLightNode),
    SpotLight(SpotLightNode),
    PointLight(PointLightNode),
    Ibl(IblNode),
}

impl NodeBehavior for NodeKind {
    fn update(&mut self, node: NodeContext<'_>, state: &mut RenderState) {
        match self {
            NodeKind::Transform => (),
            NodeKind::Mesh(mesh) => mesh.update(node, state),
            NodeKind::Camera(camera) => camera.update(node, state),
            NodeKind::DirectionalLight(light) => light.update(node, state),
            NodeKind::SpotLight(light) => light.update(node, state),
            NodeKind::PointLight(light) => light.update(node, state),
            NodeKind::Ibl(ibl) => ibl.update(node, state),
        }
    }

    fn mid_frame_cleanup(&mut self) {
        match self {
            NodeKind::Transform => (),
            NodeKind::Mesh(mesh) => mesh.mid_frame_cleanup(),
            NodeKind::Camera(camera) => camera.mid_frame_cleanup(),
            NodeKind::DirectionalLight(light) => light.mid_frame_cleanup(),
            NodeKind::SpotLight(light) => light.mid_frame_cleanup(),
            NodeKind::PointLight(light) => light.mid_frame_cleanup(),
            NodeKind::Ibl(ibl) => ibl.mid_frame_cleanup(),
        }
    }
}

#[derive(Debug)]
pub struct Node {
    id: NodeId,
    name: String,
    enabled: bool,
    transform_dirty: bool,
    hierarchy_dirty: bool,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    transform: TransformNode,
    kind: NodeKind,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_transform_dirty(&self) -> bool {
        self.transform_dirty
    }

    pub fn is_hierarchy_dirty(&self) -> bool {
        self.hierarchy_dirty
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn transform(&self) -> &TransformNode {
        &self.transform
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug)]
pub struct SceneGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
}

impl SceneGraph {
    /// Creates a graph with a single transform root. The root starts out
    /// hierarchy dirty, so the first traversal always reports a hierarchy change.
    pub fn new(root_name: &str) -> Self {
        let mut graph = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
        };
        graph.root = graph.create_node(root_name, NodeKind::Transform);
        graph
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn expect_node_mut(&mut self, id: NodeId) -> anyhow::Result<&mut Node> {
        self.node_mut(id)
            .ok_or_else(|| anyhow!("node {:?} does not exist (removed or never created)", id))
    }

    /// Edits a node's payload, e.g. to change a light's colour. Payload edits
    /// mark the node transform dirty. Replacing the variant changes which
    /// instances and lights the node contributes, so it marks the node
    /// hierarchy dirty instead.
    pub fn modify_kind<R>(
        &mut self,
        id: NodeId,
        edit: impl FnOnce(&mut NodeKind) -> R,
    ) -> anyhow::Result<R> {
        let node = self.expect_node_mut(id)?;
        let before = std::mem::discriminant(&node.kind);
        let result = edit(&mut node.kind);
        if std::mem::discriminant(&node.kind) != before {
            node.hierarchy_dirty = true;
        }
        node.transform_dirty = true;
        Ok(result)
    }

    /// Allocates a detached node. It becomes part of the scene once it is
    /// attached with [`SceneGraph::add_child`].
    pub fn create_node(&mut self, name: &str, kind: NodeKind) -> NodeId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = NodeId {
            index,
            generation: slot.generation,
        };
        slot.node = Some(Node {
            id,
            name: name.to_string(),
            enabled: true,
            transform_dirty: true,
            hierarchy_dirty: true,
            parent: None,
            children: Vec::new(),
            transform: TransformNode::new(),
            kind,
        });
        id
    }

    /// Creates a node and appends it to `parent` in one step.
    pub fn spawn(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> anyhow::Result<NodeId> {
        let id = self.create_node(name, kind);
        if let Err(e) = self.add_child(parent, id) {
            self.free_subtree(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Appends `child` to `parent`'s children. A child that already has a
    /// parent is moved, which marks both the old parent and the child
    /// hierarchy dirty.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> anyhow::Result<()> {
        ensure!(self.contains(parent), "parent {:?} does not exist", parent);
        ensure!(self.contains(child), "child {:?} does not exist", child);
        ensure!(child != self.root, "the root cannot become a child");
        ensure!(parent != child, "a node cannot be its own child");
        if self.is_ancestor(child, parent) {
            bail!(
                "attaching {:?} below {:?} would create a cycle",
                child,
                parent
            );
        }
        self.detach(child);
        self.expect_node_mut(parent)?.children.push(child);
        let node = self.expect_node_mut(child)?;
        node.parent = Some(parent);
        node.hierarchy_dirty = true;
        self.mark_subtree_transform_dirty(child);
        Ok(())
    }

    /// Removes `id` and its whole subtree from the graph.
    pub fn remove(&mut self, id: NodeId) -> anyhow::Result<()> {
        ensure!(id != self.root, "the root node cannot be removed");
        ensure!(self.contains(id), "node {:?} does not exist", id);
        self.detach(id);
        self.free_subtree(id);
        Ok(())
    }

    fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.node(id).and_then(|n| n.parent) else {
            return;
        };
        if let Some(parent_node) = self.node_mut(parent) {
            parent_node.children.retain(|c| *c != id);
            parent_node.hierarchy_dirty = true;
        }
        if let Some(node) = self.node_mut(id) {
            node.parent = None;
        }
    }

    fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(slot) = self
                .slots
                .get_mut(id.index as usize)
                .filter(|slot| slot.generation == id.generation)
            else {
                continue;
            };
            if let Some(node) = slot.node.take() {
                stack.extend(node.children);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
            }
        }
    }

    /// Whether `ancestor` is `node` or lies on the path from `node` to the root.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.node(id).and_then(|n| n.parent);
        }
        false
    }

    /// Depth-first search below `parent` (excluding `parent` itself).
    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let mut stack: Vec<NodeId> = self.node(parent)?.children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let node = self.node(id)?;
            if node.name == name {
                return Some(id);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        None
    }

    /// Depth-first search over the whole graph, starting at the root.
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        match self.node(self.root) {
            Some(root) if root.name == name => Some(self.root),
            _ => self.find_child(self.root, name),
        }
    }

    /// Node ids reachable from `from` in pre-order, children in insertion order.
    pub fn depth_first(&self, from: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.node(id) {
                order.push(id);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        order
    }

    pub fn set_enabled(&mut self, id: NodeId, enabled: bool) -> anyhow::Result<()> {
        let node = self.expect_node_mut(id)?;
        if node.enabled == enabled {
            return Ok(());
        }
        node.enabled = enabled;
        node.hierarchy_dirty = true;
        self.mark_subtree_transform_dirty(id);
        Ok(())
    }

    pub fn set_position(&mut self, id: NodeId, position: Vector3<f32>) -> anyhow::Result<()> {
        self.modify_transform(id, |t| t.set_position(position))
    }

    pub fn set_orientation(&mut self, id: NodeId, orientation: Quaternion<f32>) -> anyhow::Result<()> {
        self.modify_transform(id, |t| t.set_orientation(orientation))
    }

    pub fn set_scale(&mut self, id: NodeId, scale: Vector3<f32>) -> anyhow::Result<()> {
        self.modify_transform(id, |t| t.set_scale(scale))
    }

    pub fn move_by(&mut self, id: NodeId, offset: Vector3<f32>) -> anyhow::Result<()> {
        self.modify_transform(id, |t| t.move_by(offset))
    }

    pub fn rotate(&mut self, id: NodeId, axis: Vector3<f32>, angle: impl Into<Rad<f32>>) -> anyhow::Result<()> {
        let angle = angle.into();
        self.modify_transform(id, |t| t.rotate(axis, angle))
    }

    pub fn rotate_x(&mut self, id: NodeId, angle: impl Into<Rad<f32>>) -> anyhow::Result<()> {
        self.rotate(id, Vector3::unit_x(), angle)
    }

    pub fn rotate_y(&mut self, id: NodeId, angle: impl Into<Rad<f32>>) -> anyhow::Result<()> {
        self.rotate(id, Vector3::unit_y(), angle)
    }

    pub fn rotate_z(&mut self, id: NodeId, angle: impl Into<Rad<f32>>) -> anyhow::Result<()> {
        self.rotate(id, Vector3::unit_z(), angle)
    }

    fn modify_transform(
        &mut self,
        id: NodeId,
        mutation: impl FnOnce(&mut TransformNode),
    ) -> anyhow::Result<()> {
        mutation(&mut self.expect_node_mut(id)?.transform);
        self.mark_subtree_transform_dirty(id);
        Ok(())
    }

    fn mark_subtree_transform_dirty(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.node_mut(id) {
                node.transform_dirty = true;
                stack.extend(node.children.iter().copied());
            }
        }
    }

    /// Walks the graph once in pre-order: classifies the frame's change level,
    /// clears each visited node's dirty flags, recomputes dirty transforms
    /// against the parent's scale-stripped matrix and lets every enabled node
    /// publish itself into `state`. Disabled nodes consume their flags but
    /// their subtrees are skipped.
    pub fn traverse(&mut self, state: &mut RenderState) -> SceneState {
        let mut level = SceneState::Ready;
        let mut stack: Vec<(NodeId, Matrix4<f32>)> = vec![(self.root, Matrix4::identity())];
        while let Some((id, parent_without_scale)) = stack.pop() {
            let Some(node) = self.node_mut(id) else {
                continue;
            };
            if node.hierarchy_dirty {
                level = SceneState::HierarchyUpdated;
            } else if node.transform_dirty {
                level = level.max(SceneState::TransformsUpdated);
            }
            let recompute = node.transform_dirty || node.hierarchy_dirty;
            node.transform_dirty = false;
            node.hierarchy_dirty = false;

            node.transform.snapshot();
            if recompute {
                node.transform.recompute(&parent_without_scale);
            }
            if !node.enabled {
                continue;
            }
            node.kind.update(
                NodeContext {
                    id,
                    name: &node.name,
                    transform: &node.transform,
                },
                state,
            );
            let without_scale = node.transform.model_matrix_without_scale();
            stack.extend(node.children.iter().rev().map(|c| (*c, without_scale)));
        }
        level
    }

    /// Runs [`NodeBehavior::mid_frame_cleanup`] on every live node.
    pub fn mid_frame_cleanup(&mut self) {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.node.as_mut())
            .for_each(|node| node.kind.mid_frame_cleanup());
    }

    /// Marks the root hierarchy dirty, forcing the next traversal to report a
    /// hierarchy change.
    pub(crate) fn invalidate_hierarchy(&mut self) {
        let root = self.root;
        if let Some(node) = self.node_mut(root) {
            node.hierarchy_dirty = true;
        }
    }
}

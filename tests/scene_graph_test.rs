use std::sync::Arc;

use cgmath::{Deg, Vector3};
use trace_ngin::{
    config::RenderSettings,
    data_structures::{
        camera::CameraNode,
        light::{DirectionalLightNode, IblNode, SpotLightNode},
        scene_graph::{MeshNode, NodeKind, SceneGraph},
    },
    render_state::{LightKind, RenderState},
    resources::{MaterialData, ResourceManager, cube_mesh_data},
    scene::{Scene, SceneState},
};

use crate::common::test_utils::{SceneDriver, TestScene, assert_vec3_eq, init_logger};

mod common;

#[test]
fn find_nodes_by_name() {
    let mut graph = SceneGraph::new("root");
    let root = graph.root();
    let a = graph.spawn(root, "a", NodeKind::Transform).unwrap();
    let b = graph.spawn(a, "b", NodeKind::Transform).unwrap();
    let c = graph.spawn(root, "c", NodeKind::Transform).unwrap();

    assert_eq!(graph.find_node("root"), Some(root));
    assert_eq!(graph.find_node("b"), Some(b));
    assert_eq!(graph.find_child(a, "b"), Some(b));
    assert_eq!(graph.find_child(c, "b"), None);
    assert_eq!(graph.find_child(a, "a"), None);
    assert_eq!(graph.depth_first(root), vec![root, a, b, c]);
}

#[test]
fn reparenting_moves_the_subtree() {
    let mut graph = SceneGraph::new("root");
    let root = graph.root();
    let a = graph.spawn(root, "a", NodeKind::Transform).unwrap();
    let b = graph.spawn(root, "b", NodeKind::Transform).unwrap();
    let child = graph.spawn(a, "child", NodeKind::Transform).unwrap();
    graph.traverse(&mut RenderState::new((1, 1)));

    graph.add_child(b, child).unwrap();

    assert!(graph.node(a).unwrap().children().is_empty());
    assert_eq!(graph.node(b).unwrap().children(), &[child]);
    assert_eq!(graph.node(child).unwrap().parent(), Some(b));
    assert!(graph.node(a).unwrap().is_hierarchy_dirty());
    assert!(graph.node(child).unwrap().is_hierarchy_dirty());
}

#[test]
fn cycles_and_root_manipulation_are_rejected() {
    let mut graph = SceneGraph::new("root");
    let root = graph.root();
    let a = graph.spawn(root, "a", NodeKind::Transform).unwrap();
    let b = graph.spawn(a, "b", NodeKind::Transform).unwrap();

    assert!(graph.add_child(b, a).is_err());
    assert!(graph.add_child(a, a).is_err());
    assert!(graph.add_child(a, root).is_err());
    assert!(graph.remove(root).is_err());
    assert_eq!(graph.node(b).unwrap().parent(), Some(a));
}

#[test]
fn removing_a_node_frees_its_subtree() {
    let mut graph = SceneGraph::new("root");
    let root = graph.root();
    let a = graph.spawn(root, "a", NodeKind::Transform).unwrap();
    let b = graph.spawn(a, "b", NodeKind::Transform).unwrap();
    assert_eq!(graph.len(), 3);

    graph.remove(a).unwrap();

    assert_eq!(graph.len(), 1);
    assert!(!graph.contains(a));
    assert!(!graph.contains(b));
    assert!(graph.node(root).unwrap().children().is_empty());
    assert!(graph.remove(a).is_err());
    assert!(graph.set_position(b, Vector3::new(1.0, 0.0, 0.0)).is_err());
}

#[test]
fn stale_handles_do_not_alias_reused_slots() {
    let mut graph = SceneGraph::new("root");
    let root = graph.root();
    let old = graph.spawn(root, "old", NodeKind::Transform).unwrap();
    graph.remove(old).unwrap();
    let new = graph.spawn(root, "new", NodeKind::Transform).unwrap();

    assert_eq!(old.index(), new.index());
    assert!(!graph.contains(old));
    assert_eq!(graph.node(new).unwrap().name(), "new");
}

#[test]
fn first_update_is_a_hierarchy_change_then_ready() {
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(2, &settings).unwrap();
    let mut driver = SceneDriver::new((64, 64));

    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::HierarchyUpdated);
    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::Ready);
    assert_eq!(test_scene.scene.state(), SceneState::Ready);
}

#[test]
fn changes_are_classified_by_their_coarsest_level() {
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(2, &settings).unwrap();
    let mut driver = SceneDriver::new((64, 64));
    driver.update_only(&mut test_scene.scene);
    let cube = test_scene.cubes[0];

    test_scene
        .scene
        .graph_mut()
        .move_by(cube, Vector3::new(0.0, 1.0, 0.0))
        .unwrap();
    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::TransformsUpdated);

    test_scene.scene.graph_mut().rotate_x(cube, Deg(10.0)).unwrap();
    test_scene.scene.graph_mut().set_enabled(test_scene.cubes[1], false).unwrap();
    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::HierarchyUpdated);

    test_scene.add_cube().unwrap();
    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::HierarchyUpdated);

    test_scene.scene.graph_mut().remove(cube).unwrap();
    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::HierarchyUpdated);

    // enabling an already enabled node is not a change
    test_scene.scene.graph_mut().set_enabled(test_scene.group, true).unwrap();
    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::Ready);
}

#[test]
fn payload_edits_count_as_transform_changes() {
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(1, &settings).unwrap();
    let mut driver = SceneDriver::new((64, 64));
    driver.update_only(&mut test_scene.scene);

    test_scene
        .scene
        .graph_mut()
        .modify_kind(test_scene.light, |kind| {
            if let NodeKind::PointLight(light) = kind {
                light.intensity = 50.0;
            }
        })
        .unwrap();

    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::TransformsUpdated);
    assert_eq!(driver.state.point_lights()[0].intensity, 50.0);
}

#[test]
fn replacing_a_node_variant_is_a_hierarchy_change() {
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(1, &settings).unwrap();
    let mut driver = SceneDriver::new((64, 64));
    driver.update_only(&mut test_scene.scene);
    assert_eq!(driver.state.meshes().len(), 1);

    let cube = MeshNode::new(test_scene.cube.clone());
    test_scene
        .scene
        .graph_mut()
        .modify_kind(test_scene.group, |kind| *kind = NodeKind::Mesh(cube))
        .unwrap();

    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::HierarchyUpdated);
    assert_eq!(driver.state.meshes().len(), 2);

    // a stale handle is an error, not a silent no-op
    let removed = test_scene.cubes[0];
    test_scene.scene.graph_mut().remove(removed).unwrap();
    assert!(test_scene.scene.graph_mut().modify_kind(removed, |_| ()).is_err());
}

#[test]
fn disabled_subtrees_are_not_rendered() {
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(3, &settings).unwrap();
    let mut driver = SceneDriver::new((64, 64));
    driver.update_only(&mut test_scene.scene);
    assert_eq!(driver.state.meshes().len(), 3);

    test_scene.scene.graph_mut().set_enabled(test_scene.group, false).unwrap();
    driver.update_only(&mut test_scene.scene);
    assert!(driver.state.meshes().is_empty());

    // moving a node below a disabled parent does not wake the scene up
    test_scene
        .scene
        .graph_mut()
        .move_by(test_scene.cubes[0], Vector3::new(1.0, 0.0, 0.0))
        .unwrap();
    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::Ready);

    test_scene.scene.graph_mut().set_enabled(test_scene.group, true).unwrap();
    assert_eq!(driver.update_only(&mut test_scene.scene), SceneState::HierarchyUpdated);
    assert_eq!(driver.state.meshes().len(), 3);
}

#[test]
fn mesh_instances_carry_node_data() {
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(2, &settings).unwrap();
    let material = test_scene
        .resources
        .add_material(MaterialData::default())
        .unwrap();
    let root = test_scene.scene.root();
    let node = MeshNode::new(test_scene.cube.clone())
        .with_material(Arc::clone(&material))
        .with_instance_index(7);
    let tinted = test_scene
        .scene
        .graph_mut()
        .spawn(root, "tinted", NodeKind::Mesh(node))
        .unwrap();
    let mut driver = SceneDriver::new((64, 64));

    driver.update_only(&mut test_scene.scene);

    let instances = driver.state.meshes();
    assert_eq!(instances.len(), 3);
    assert_eq!(instances[0].node, test_scene.cubes[0]);
    assert_eq!(instances[1].model.w.x, 1.5);
    let tinted_instance = instances.iter().find(|i| i.node == tinted).unwrap();
    assert_eq!(tinted_instance.custom_index, 7);
    assert_eq!(tinted_instance.material, Some(material.id));
    assert_eq!(tinted_instance.mesh, test_scene.cube.id);
}

#[test]
fn instance_slots_only_live_for_one_frame() {
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(1, &settings).unwrap();
    let mut driver = SceneDriver::new((64, 64));
    let cube = test_scene.cubes[0];
    let slot = |scene: &Scene| match scene.graph().node(cube).unwrap().kind() {
        NodeKind::Mesh(mesh) => mesh.instance_slot(),
        _ => unreachable!(),
    };

    driver.update_only(&mut test_scene.scene);
    assert_eq!(slot(&test_scene.scene), Some(0));

    test_scene.scene.end_frame();
    assert_eq!(slot(&test_scene.scene), None);
}

#[test]
fn first_enabled_camera_is_used_unless_one_is_designated() {
    init_logger();
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(1, &settings).unwrap();
    let root = test_scene.scene.root();
    let second = test_scene
        .scene
        .graph_mut()
        .spawn(root, "second camera", NodeKind::Camera(CameraNode::new(Deg(45.0), 0.1, 10.0)))
        .unwrap();
    let mut driver = SceneDriver::new((64, 32));

    driver.update_only(&mut test_scene.scene);
    let camera = driver.state.camera().unwrap();
    assert_eq!(camera.node, test_scene.camera);
    assert_eq!(camera.position.z, 5.0);

    test_scene.scene.set_active_camera(Some(second));
    driver.update_only(&mut test_scene.scene);
    assert_eq!(driver.state.camera().unwrap().node, second);

    // a disabled designated camera falls back to the first enabled one
    test_scene.scene.graph_mut().set_enabled(second, false).unwrap();
    driver.update_only(&mut test_scene.scene);
    assert_eq!(driver.state.camera().unwrap().node, test_scene.camera);
}

#[test]
fn camera_aspect_follows_the_image_extent() {
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(0, &settings).unwrap();
    let mut driver = SceneDriver::new((200, 100));

    driver.update_only(&mut test_scene.scene);

    match test_scene.scene.graph().node(test_scene.camera).unwrap().kind() {
        NodeKind::Camera(camera) => assert_eq!(camera.aspect(), 2.0),
        _ => unreachable!(),
    }
}

#[test]
fn lights_are_grouped_by_kind() {
    init_logger();
    let settings = RenderSettings::default();
    let mut test_scene = TestScene::new(0, &settings).unwrap();
    let mut resources = ResourceManager::new(4);
    let environment = resources.add_texture("sky", 16, 8).unwrap();
    let root = test_scene.scene.root();
    let graph = test_scene.scene.graph_mut();
    let sun = graph
        .spawn(root, "sun", NodeKind::DirectionalLight(DirectionalLightNode::default()))
        .unwrap();
    graph.rotate_x(sun, Deg(-90.0)).unwrap();
    graph
        .spawn(root, "spot", NodeKind::SpotLight(SpotLightNode::default()))
        .unwrap();
    let ibl = IblNode {
        environment,
        intensity: 1.0,
    };
    let first_ibl = graph.spawn(root, "ibl", NodeKind::Ibl(ibl.clone())).unwrap();
    graph.spawn(root, "second ibl", NodeKind::Ibl(ibl)).unwrap();
    let mut driver = SceneDriver::new((64, 64));

    driver.update_only(&mut test_scene.scene);

    let state = &driver.state;
    assert_eq!(state.light_count(), 3);
    let kinds: Vec<LightKind> = state.lights().map(|l| l.kind).collect();
    assert_eq!(kinds, vec![LightKind::Directional, LightKind::Spot, LightKind::Point]);
    let sun_direction = state.directional_lights()[0].direction;
    assert_vec3_eq(sun_direction, Vector3::new(0.0, -1.0, 0.0));
    assert_eq!(state.point_lights()[0].position.y, 4.0);
    assert_eq!(state.ibl().unwrap().node, first_ibl);
}

#[test]
fn invalid_meshes_are_rejected() {
    let mut resources = ResourceManager::new(1);
    let mut data = cube_mesh_data("broken");
    data.indices.push(0);
    assert!(resources.add_mesh(data, None).is_err());

    let mut data = cube_mesh_data("out of range");
    data.indices[0] = 100;
    assert!(resources.add_mesh(data, None).is_err());

    resources.add_material(MaterialData::default()).unwrap();
    assert!(resources.add_material(MaterialData::default()).is_err());
}

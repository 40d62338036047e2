//! Scene data structures: transforms, node variants and resources.
//!
//! - `transform` holds the per-node TRS state and derived model matrices
//! - `scene_graph` is the node arena with dirty tracking and traversal
//! - `camera` and `light` are the node variants that publish views each frame
//! - `mesh` contains immutable mesh, material and texture resources

pub mod camera;
pub mod light;
pub mod mesh;
pub mod scene_graph;
pub mod transform;

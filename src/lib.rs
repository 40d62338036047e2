//! trace-ngin
//!
//! A progressive path-tracing core: a hierarchical scene graph with dirty
//! tracking, a top-level acceleration structure that is rebuilt or updated in
//! place as the scene changes, integrators that accumulate samples across
//! frames (optionally tile by tile) and a renderer that tone-maps, overlays
//! debug rays and captures frames to disk.
//!
//! High-level modules
//! - `app`: window host running the frame loop
//! - `config`: runtime-configurable render settings
//! - `context`: wgpu device, queue and window surface
//! - `data_structures`: transforms, scene graph nodes and immutable resources
//! - `gpu`: the backend interface the core records commands against, plus its wgpu implementation
//! - `integrator`: progressive accumulation, tiling and debug rays
//! - `render_state`: per-frame snapshot of the scene
//! - `renderer`: frame orchestration
//! - `resources`: id allocation and ownership of meshes, materials and textures
//! - `scene`: scene graph plus acceleration-structure lifecycle
//!

pub mod app;
pub mod config;
pub mod context;
pub mod data_structures;
pub mod gpu;
pub mod integrator;
pub mod render_state;
pub mod renderer;
pub mod resources;
pub mod scene;

// Re-exports commonly used types for convenience in downstream code.
pub use cgmath::*;
pub use config::{RenderSettings, ToneMapOperator};
pub use renderer::Renderer;
pub use scene::{Scene, SceneState};

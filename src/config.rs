//! Runtime-configurable render settings.
//!
//! Every field can be changed while the renderer is running through
//! [`crate::renderer::Renderer::apply_settings`]. Capacity fields bound the
//! GPU buffers that are allocated up front; exceeding them is a fatal
//! configuration error rather than a reason to grow the buffers.

use anyhow::ensure;

/// Operator used to map accumulated HDR radiance into the display range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ToneMapOperator {
    #[default]
    Aces,
    Reinhard,
}

impl ToneMapOperator {
    /// Discriminant as read by the tone-map shader.
    pub fn shader_id(self) -> u32 {
        match self {
            ToneMapOperator::Aces => 0,
            ToneMapOperator::Reinhard => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderSettings {
    /// Capacity of the top-level acceleration structure.
    pub max_instances: u32,
    pub max_lights: u32,
    /// Material capacity of the [`ResourceManager`](crate::resources::ResourceManager).
    pub max_materials: u32,
    /// Edge length of a square tile in pixels.
    pub tile_size: u32,
    pub tiled: bool,
    /// Samples per pixel a bake converges to (per tile in tiled mode).
    pub max_samples: u32,
    pub bounce_limit: u32,
    pub tone_map: ToneMapOperator,
    pub exposure: f32,
    pub frames_in_flight: usize,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            max_instances: 1024,
            max_lights: 64,
            max_materials: 256,
            tile_size: 256,
            tiled: false,
            max_samples: 5000,
            bounce_limit: 8,
            tone_map: ToneMapOperator::Aces,
            exposure: 1.0,
            frames_in_flight: 2,
        }
    }
}

impl RenderSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.max_instances > 0, "max_instances must be at least 1");
        ensure!(self.max_lights > 0, "max_lights must be at least 1");
        ensure!(self.tile_size > 0, "tile_size must be at least 1 pixel");
        ensure!(self.max_samples > 0, "max_samples must be at least 1");
        ensure!(
            self.frames_in_flight > 0,
            "at least one frame in flight is required"
        );
        ensure!(
            self.exposure.is_finite() && self.exposure > 0.0,
            "exposure must be a positive finite number, got {}",
            self.exposure
        );
        Ok(())
    }

    /// Whether switching from `self` to `other` invalidates an ongoing bake.
    ///
    /// Tone mapping and capacities only affect presentation or allocation,
    /// so they leave the accumulated samples intact.
    pub fn invalidates_bake(&self, other: &RenderSettings) -> bool {
        self.tile_size != other.tile_size
            || self.tiled != other.tiled
            || self.max_samples != other.max_samples
            || self.bounce_limit != other.bounce_limit
    }
}

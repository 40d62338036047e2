use std::sync::Arc;

use anyhow::Context as _;
use winit::window::Window;

/// Format of the offscreen presentation target. Tone mapping writes linear
/// values and the hardware applies the sRGB transfer function on store.
pub const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

#[derive(Debug)]
pub struct SurfaceTarget {
    pub surface: wgpu::Surface<'static>,
    pub config: wgpu::SurfaceConfiguration,
}

/// The GPU device and, when rendering to a window, its surface.
#[derive(Debug)]
pub struct Context {
    pub(crate) window: Option<Arc<Window>>,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub(crate) surface: Option<SurfaceTarget>,
    pub(crate) extent: (u32, u32),
}

impl Context {
    /// Sets up the device against the window's surface.
    pub async fn new(window: Arc<Window>) -> anyhow::Result<Self> {
        let size = window.inner_size();
        log::debug!("WGPU setup for window {}x{}", size.width, size.height);
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..wgpu::InstanceDescriptor::new_without_display_handle()
        });
        let surface = instance
            .create_surface(window.clone())
            .context("failed to create window surface")?;
        let (device, queue, adapter) = request_device(&instance, Some(&surface)).await?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .context("surface reports no supported formats")?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: surface_caps
                .present_modes
                .first()
                .copied()
                .unwrap_or(wgpu::PresentMode::Fifo),
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        Ok(Self {
            window: Some(window),
            device,
            queue,
            surface: Some(SurfaceTarget { surface, config }),
            extent: (size.width.max(1), size.height.max(1)),
        })
    }

    /// Sets up a device without a surface for offscreen rendering.
    pub async fn headless(width: u32, height: u32) -> anyhow::Result<Self> {
        log::debug!("WGPU headless setup {}x{}", width, height);
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..wgpu::InstanceDescriptor::new_without_display_handle()
        });
        let (device, queue, _) = request_device(&instance, None).await?;
        Ok(Self {
            window: None,
            device,
            queue,
            surface: None,
            extent: (width, height),
        })
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn window(&self) -> Option<&Arc<Window>> {
        self.window.as_ref()
    }

    pub(crate) fn resize(&mut self, width: u32, height: u32) {
        self.extent = (width, height);
        if let Some(target) = self.surface.as_mut() {
            target.config.width = width;
            target.config.height = height;
            target.surface.configure(&self.device, &target.config);
        }
    }

    /// Reconfigures the surface after it was lost or became outdated.
    pub(crate) fn reconfigure_surface(&self) {
        if let Some(target) = self.surface.as_ref() {
            target.surface.configure(&self.device, &target.config);
        }
    }
}

async fn request_device(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'static>>,
) -> anyhow::Result<(wgpu::Device, wgpu::Queue, wgpu::Adapter)> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface,
            force_fallback_adapter: false,
        })
        .await
        .context("no compatible GPU adapter")?;
    log::info!("Using adapter {:?}", adapter.get_info().name);
    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("Trace Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            ..Default::default()
        })
        .await
        .context("failed to request GPU device")?;
    Ok((device, queue, adapter))
}

//! Window host and frame loop.
//!
//! [`run`] opens a window, sets up a [`WgpuBackend`] on its surface and
//! renders the given [`Scene`] with a [`PathIntegrator`] until the window is
//! closed. Every frame the caller's update hook may mutate the scene or the
//! renderer before the frame is recorded.
//!
//! Built-in input:
//! - right click gathers debug rays through the pixel under the cursor
//! - `Escape` clears all debug views
//! - `R` restarts the bake

use std::sync::Arc;

use instant::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalPosition,
    event::{ElementState, KeyEvent, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use crate::{
    config::RenderSettings,
    context::Context,
    gpu::wgpu_backend::WgpuBackend,
    integrator::PathIntegrator,
    renderer::Renderer,
    scene::Scene,
};

/// Debug rays gathered per right click.
const DEBUG_RAY_COUNT: u32 = 16;

type UpdateFn = Box<dyn FnMut(&mut Scene, &mut Renderer<WgpuBackend>, Duration)>;

struct Running {
    window: Arc<Window>,
    renderer: Renderer<WgpuBackend>,
}

struct App {
    async_runtime: tokio::runtime::Runtime,
    scene: Scene,
    settings: RenderSettings,
    on_update: UpdateFn,
    running: Option<Running>,
    cursor: PhysicalPosition<f64>,
    last_time: Instant,
}

impl App {
    fn new(scene: Scene, settings: RenderSettings, on_update: UpdateFn) -> anyhow::Result<Self> {
        Ok(Self {
            async_runtime: tokio::runtime::Runtime::new()?,
            scene,
            settings,
            on_update,
            running: None,
            cursor: PhysicalPosition::new(0.0, 0.0),
            last_time: Instant::now(),
        })
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<Running> {
        let window_attributes = Window::default_attributes().with_title("trace-ngin");
        let window = Arc::new(event_loop.create_window(window_attributes)?);
        let context = self.async_runtime.block_on(Context::new(window.clone()))?;
        let extent = context.extent();
        let backend = WgpuBackend::new(context)?;
        let integrator = Box::new(PathIntegrator::new(&self.settings));
        let renderer = Renderer::new(backend, integrator, self.settings.clone(), extent)?;
        Ok(Running { window, renderer })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut running) = self.running.take() {
            running.renderer.release(&mut self.scene);
        }
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.running.is_some() {
            return;
        }
        match self.start(event_loop) {
            Ok(running) => {
                running.window.request_redraw();
                self.last_time = Instant::now();
                self.running = Some(running);
            }
            Err(e) => {
                log::error!("Failed to start renderer: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        match event {
            WindowEvent::CloseRequested => self.shutdown(event_loop),
            WindowEvent::Resized(size) => {
                if let Err(e) = running.renderer.on_window_resize(size.width, size.height) {
                    log::error!("Resize to {}x{} failed: {:#}", size.width, size.height, e);
                }
            }
            WindowEvent::CursorMoved { position, .. } => self.cursor = position,
            WindowEvent::MouseInput {
                state: ElementState::Pressed,
                button: MouseButton::Right,
                ..
            } => {
                let pixel = (self.cursor.x.max(0.0) as u32, self.cursor.y.max(0.0) as u32);
                running.renderer.request_debug_rays(pixel, DEBUG_RAY_COUNT);
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key,
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match logical_key {
                Key::Named(NamedKey::Escape) => running.renderer.clear_debug_views(),
                Key::Character(c) if c.eq_ignore_ascii_case("r") => running.renderer.restart_bake(),
                _ => (),
            },
            WindowEvent::RedrawRequested => {
                let dt = self.last_time.elapsed();
                self.last_time = Instant::now();
                (self.on_update)(&mut self.scene, &mut running.renderer, dt);
                match running.renderer.render_frame(&mut self.scene) {
                    Ok(report) => log::trace!("{:?}", report),
                    Err(e) => log::error!("{:#}", e),
                }
                running.window.request_redraw();
            }
            _ => (),
        }
    }
}

/// Opens a window and renders `scene` until the window is closed.
///
/// `on_update` runs before every frame with the time since the previous one.
pub fn run(
    scene: Scene,
    settings: RenderSettings,
    on_update: impl FnMut(&mut Scene, &mut Renderer<WgpuBackend>, Duration) + 'static,
) -> anyhow::Result<()> {
    if let Err(e) = env_logger::try_init() {
        println!("Warning: Could not initialize logger: {}", e);
    };
    settings.validate()?;

    let event_loop = EventLoop::new()?;
    let mut app = App::new(scene, settings, Box::new(on_update))?;
    event_loop.run_app(&mut app)?;
    Ok(())
}

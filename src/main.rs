// =============================================================================
// VKFRAME HOST - winit window driving the renderer core
// =============================================================================
//
// FRAME FLOW (per RedrawRequested):
// 1. Update the spinning-cube uniforms
// 2. Renderer::render: wait slot fence, acquire, submit render + copy, present
// 3. Update the FPS counter in the window title
//
// Resizes are latched on the window surface and picked up by the renderer
// on its next frame; a minimized window skips frames until restored.
//
// =============================================================================

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use glam::{Mat4, Vec3};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use vkframe::{Config, FrameOutcome, Mesh, MeshUniforms, Renderer, Vertex, WindowSurface};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    // Configuration picks the log level, so it is read before logging exists
    let (config, source) = Config::load(CONFIG_PATH);

    init_logging(&config)?;
    log::info!("Starting vkframe host");
    source.log();
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present modes: {:?}", config.graphics.present_modes);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Logger at the configured level; directives in `env` (RUST_LOG for the
/// host) are applied on top and win.
fn log_builder<'a>(config: &Config, env: impl Into<Env<'a>>) -> Builder {
    let mut builder = Builder::new();
    builder.filter_level(config.log_filter()).parse_env(env);
    builder
}

/// Initialize logging, optionally into a log file
fn init_logging(config: &Config) -> Result<()> {
    let mut builder = log_builder(config, Env::default());

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {:?}", config.debug.log_file))?;
        writeln!(file, "=== vkframe log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

/// Unit cube with per-corner colors. Faces wind counter-clockwise seen
/// from outside.
fn cube_mesh() -> Mesh {
    let corners = [
        [-0.5, -0.5, -0.5],
        [0.5, -0.5, -0.5],
        [0.5, 0.5, -0.5],
        [-0.5, 0.5, -0.5],
        [-0.5, -0.5, 0.5],
        [0.5, -0.5, 0.5],
        [0.5, 0.5, 0.5],
        [-0.5, 0.5, 0.5],
    ];
    let vertices = corners
        .iter()
        .map(|&[x, y, z]| Vertex::new([x, y, z], [x + 0.5, y + 0.5, z + 0.5]))
        .collect();

    #[rustfmt::skip]
    let indices = vec![
        4, 5, 6, 6, 7, 4, // +z
        1, 0, 3, 3, 2, 1, // -z
        5, 1, 2, 2, 6, 5, // +x
        0, 4, 7, 7, 3, 0, // -x
        7, 6, 2, 2, 3, 7, // +y
        0, 1, 5, 5, 4, 0, // -y
    ];

    Mesh { vertices, indices }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer goes before the window.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    surface: Option<Arc<WindowSurface>>,
    is_fullscreen: bool,

    // FPS tracking
    started: Instant,
    last_frame_time: Instant,
    last_fps_update: Instant,
    frame_count: u32,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            is_fullscreen: config.window.fullscreen,
            config,
            renderer: None,
            surface: None,
            started: now,
            last_frame_time: now,
            last_fps_update: now,
            frame_count: 0,
        }
    }

    fn init_renderer(&mut self, surface: Arc<WindowSurface>) -> Result<()> {
        let requirements = self
            .config
            .requirements()
            .context("Invalid graphics configuration")?;
        let options = self.config.renderer_options();

        let renderer = Renderer::new(&options, &requirements, surface.clone(), &cube_mesh())
            .context("Failed to create renderer")?;

        log::info!(
            "Renderer ready on {} ({} frames in flight)",
            renderer.device().name,
            renderer.frames_in_flight()
        );
        self.renderer = Some(renderer);
        self.surface = Some(surface);
        Ok(())
    }

    fn spin_uniforms(&self, renderer: &Renderer) -> MeshUniforms {
        let extent = renderer.extent();
        let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
        let angle = self.started.elapsed().as_secs_f32();

        // Vulkan clip space has Y pointing down
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        proj.y_axis.y *= -1.0;

        MeshUniforms {
            model: Mat4::from_rotation_y(angle) * Mat4::from_rotation_x(angle * 0.5),
            view: Mat4::look_at_rh(Vec3::new(2.0, 2.0, 2.0), Vec3::ZERO, Vec3::Y),
            proj,
        }
    }

    /// Render one frame; returns false when the host should exit.
    fn render_frame(&mut self) -> bool {
        let Some(mut renderer) = self.renderer.take() else {
            return true;
        };
        let uniforms = self.spin_uniforms(&renderer);
        renderer.set_uniforms(&uniforms);

        let keep_running = match renderer.render() {
            Ok(FrameOutcome::Presented { .. }) => {
                self.update_fps();
                true
            }
            Ok(FrameOutcome::Skipped) | Ok(FrameOutcome::Recreated) => true,
            Err(e) if e.is_fatal() => false,
            Err(e) => {
                log::warn!("Frame dropped: {}", e);
                true
            }
        };
        self.renderer = Some(renderer);
        keep_running
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref surface) = self.surface {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                surface.window().set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                surface.window().set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            if let Some(ref mut renderer) = self.renderer {
                renderer.request_resize();
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref surface) = self.surface {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                surface.window().set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.surface.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(Arc::new(WindowSurface::new(window))) {
            log::error!("Failed to initialize renderer: {:#}", e);
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref renderer) = self.renderer {
                    let _ = renderer.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref surface) = self.surface {
                    surface.notify_resized();
                }
            }

            WindowEvent::RedrawRequested => {
                if !self.render_frame() {
                    log::error!("Unrecoverable GPU error, exiting");
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            KeyCode::F5 => {
                                if let Some(ref mut renderer) = self.renderer {
                                    if let Err(e) = renderer.reload_shaders() {
                                        log::error!("Shader reload failed: {}", e);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref surface) = self.surface {
            surface.window().request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up...");
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_at(level: &str) -> Config {
        Config::parse(&format!("[debug]\nlog_level = \"{level}\"")).unwrap()
    }

    #[test]
    fn environment_overrides_config_level() {
        std::env::set_var("VKFRAME_TEST_LOG_OVERRIDE", "debug");
        let logger = log_builder(&config_at("info"), Env::new().filter("VKFRAME_TEST_LOG_OVERRIDE")).build();
        assert_eq!(logger.filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn config_level_applies_without_environment() {
        let logger = log_builder(&config_at("warn"), Env::new().filter("VKFRAME_TEST_LOG_UNSET")).build();
        assert_eq!(logger.filter(), log::LevelFilter::Warn);
    }

    #[test]
    fn cube_faces_index_every_corner() {
        let mesh = cube_mesh();
        assert_eq!(mesh.vertices.len(), 8);
        assert_eq!(mesh.indices.len(), 36);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
    }
}

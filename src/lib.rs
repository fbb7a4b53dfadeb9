//! GPU resource and frame-synchronization core for an ash-based renderer.
//!
//! Declare hardware needs as [`Requirements`], hand a [`SurfaceProvider`]
//! to [`Renderer::new`], then call [`Renderer::render`] once per frame.

pub mod backend;
pub mod config;
pub mod error;
pub mod hot_reload;
pub mod pacer;
pub mod renderer;
pub mod requirements;
pub mod window;

pub use backend::pipeline::{ShaderPaths, Vertex};
pub use backend::surface::SurfaceProvider;
pub use backend::VulkanDevice;
pub use config::Config;
pub use error::{GpuError, Result};
pub use pacer::{FrameBackend, FrameOutcome, FramePacer};
pub use renderer::{Mesh, MeshUniforms, Renderer, RendererOptions};
pub use requirements::{QueueRole, Requirements};
pub use window::WindowSurface;

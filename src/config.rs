// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors, and
// turns the graphics section into a requirements declaration.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::pipeline::ShaderPaths;
use crate::error::GpuError;
use crate::renderer::RendererOptions;
use crate::requirements::{DevicePreference, Requirements};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vkframe".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Present modes in order of preference; FIFO is the implicit fallback.
    pub present_modes: Vec<String>,
    /// Surface formats in order of preference (sRGB non-linear color space).
    pub surface_formats: Vec<String>,
    pub swapchain_image_count: u32,
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub prefer_discrete: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_modes: vec!["mailbox".to_string(), "fifo".to_string()],
            surface_formats: vec![
                "b8g8r8a8_srgb".to_string(),
                "r8g8b8a8_srgb".to_string(),
                "b8g8r8a8_unorm".to_string(),
            ],
            swapchain_image_count: 3,
            frames_in_flight: 2,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            prefer_discrete: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Defaults on in debug builds only.
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "vkframe.log".to_string(),
            show_fps: true,
        }
    }
}

/// Compiled shader locations
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
    pub hot_reload: bool,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/mesh.vert.spv"),
            fragment: PathBuf::from("shaders/mesh.frag.spv"),
            hot_reload: cfg!(debug_assertions),
        }
    }
}

/// Where the configuration came from. Loading happens before the logger
/// is set up, so this is reported afterwards with `ConfigSource::log`.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    /// Unreadable or malformed file; defaults are used instead.
    Invalid(anyhow::Error),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => log::info!("Loaded configuration from {:?}", path),
            ConfigSource::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path)
            }
            ConfigSource::Invalid(e) => log::warn!("{:#}. Using defaults.", e),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults. Does not
    /// log; report the returned source once logging is up.
    pub fn load<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref();
        if !path.exists() {
            return (Config::default(), ConfigSource::Missing(path.to_path_buf()));
        }
        match Self::read(path) {
            Ok(config) => (config, ConfigSource::File(path.to_path_buf())),
            Err(e) => (Config::default(), ConfigSource::Invalid(e)),
        }
    }

    /// Load configuration from a specific path; a missing file gives defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let config = Self::read(path)?;
        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Log filter from `debug.log_level`, `info` if unrecognised.
    pub fn log_filter(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// Requirements declaration for the configured graphics settings.
    pub fn requirements(&self) -> Result<Requirements, GpuError> {
        let mut requirements = Requirements::default();

        requirements.device = if self.graphics.prefer_discrete {
            DevicePreference {
                preferred: vk::PhysicalDeviceType::DISCRETE_GPU,
                fallback: Some(vk::PhysicalDeviceType::INTEGRATED_GPU),
            }
        } else {
            DevicePreference {
                preferred: vk::PhysicalDeviceType::INTEGRATED_GPU,
                fallback: Some(vk::PhysicalDeviceType::DISCRETE_GPU),
            }
        };

        requirements.swapchain.image_count = self.graphics.swapchain_image_count;
        requirements.swapchain.present_modes = self
            .graphics
            .present_modes
            .iter()
            .map(|name| parse_present_mode(name))
            .collect::<Result<_, _>>()?;
        requirements.swapchain.formats = self
            .graphics
            .surface_formats
            .iter()
            .map(|name| parse_surface_format(name))
            .collect::<Result<_, _>>()?;

        Ok(requirements)
    }

    /// Renderer construction options.
    pub fn renderer_options(&self) -> RendererOptions {
        RendererOptions {
            app_name: self.window.title.clone(),
            enable_validation: self.debug.validation_layers,
            frames_in_flight: self.graphics.frames_in_flight,
            clear_color: self.graphics.clear_color,
            shaders: ShaderPaths {
                vertex: self.shaders.vertex.clone(),
                fragment: self.shaders.fragment.clone(),
            },
            hot_reload: self.shaders.hot_reload,
        }
    }
}

/// Present mode by name
pub fn parse_present_mode(name: &str) -> Result<vk::PresentModeKHR, GpuError> {
    match name.to_lowercase().as_str() {
        "immediate" => Ok(vk::PresentModeKHR::IMMEDIATE),
        "mailbox" => Ok(vk::PresentModeKHR::MAILBOX),
        "fifo" => Ok(vk::PresentModeKHR::FIFO),
        "fifo_relaxed" => Ok(vk::PresentModeKHR::FIFO_RELAXED),
        _ => Err(GpuError::InvalidConfig(format!("unknown present mode '{name}'"))),
    }
}

/// Surface format by name, paired with the sRGB non-linear color space
pub fn parse_surface_format(name: &str) -> Result<vk::SurfaceFormatKHR, GpuError> {
    let format = match name.to_lowercase().as_str() {
        "b8g8r8a8_srgb" => vk::Format::B8G8R8A8_SRGB,
        "r8g8b8a8_srgb" => vk::Format::R8G8B8A8_SRGB,
        "b8g8r8a8_unorm" => vk::Format::B8G8R8A8_UNORM,
        "r8g8b8a8_unorm" => vk::Format::R8G8B8A8_UNORM,
        "a2b10g10r10_unorm" => vk::Format::A2B10G10R10_UNORM_PACK32,
        _ => {
            return Err(GpuError::InvalidConfig(format!(
                "unknown surface format '{name}'"
            )))
        }
    };
    Ok(vk::SurfaceFormatKHR {
        format,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.graphics.swapchain_image_count, 3);
        assert_eq!(config.debug.validation_layers, cfg!(debug_assertions));
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/mesh.vert.spv"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            title = "demo"

            [graphics]
            present_modes = ["immediate", "fifo"]
            frames_in_flight = 3

            [debug]
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "demo");
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.graphics.surface_formats.len(), 3);
        assert_eq!(config.log_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::parse("[graphics\nframes_in_flight = 2").is_err());
        assert!(Config::parse("[graphics]\nframes_in_flight = \"two\"").is_err());
    }

    #[test]
    fn requirements_follow_graphics_section() {
        let config = Config::parse(
            r#"
            [graphics]
            present_modes = ["Immediate"]
            surface_formats = ["r8g8b8a8_unorm"]
            swapchain_image_count = 2
            prefer_discrete = false
            "#,
        )
        .unwrap();

        let reqs = config.requirements().unwrap();
        assert_eq!(reqs.swapchain.present_modes, vec![vk::PresentModeKHR::IMMEDIATE]);
        assert_eq!(reqs.swapchain.formats[0].format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(reqs.swapchain.image_count, 2);
        assert_eq!(reqs.device.preferred, vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert!(reqs.is_valid());
    }

    #[test]
    fn unknown_names_are_rejected() {
        let config = Config::parse("[graphics]\npresent_modes = [\"vsync\"]").unwrap();
        assert!(matches!(config.requirements(), Err(GpuError::InvalidConfig(_))));

        let config = Config::parse("[graphics]\nsurface_formats = [\"rgb565\"]").unwrap();
        assert!(matches!(config.requirements(), Err(GpuError::InvalidConfig(_))));
    }

    #[test]
    fn empty_candidate_lists_fail_validation() {
        let config = Config::parse("[graphics]\npresent_modes = []").unwrap();
        let reqs = config.requirements().unwrap();
        assert!(!reqs.is_valid());
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = Config::parse("[debug]\nlog_level = \"loud\"").unwrap();
        assert_eq!(config.log_filter(), log::LevelFilter::Info);
    }

    fn temp_config(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("vkframe-{}-{}.toml", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn broken_file_falls_back_and_keeps_the_error() {
        let path = temp_config("broken", "[graphics\nframes_in_flight = 2");
        let (config, source) = Config::load(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.graphics.frames_in_flight, 2);
        match source {
            ConfigSource::Invalid(e) => assert!(format!("{e:#}").contains("Failed to parse")),
            other => panic!("expected an invalid source, got {other:?}"),
        }
    }

    #[test]
    fn missing_and_present_files_are_told_apart() {
        let missing = std::env::temp_dir().join("vkframe-definitely-missing.toml");
        let (_, source) = Config::load(&missing);
        assert!(matches!(source, ConfigSource::Missing(p) if p == missing));

        let path = temp_config("good", "[window]\nwidth = 640");
        let (config, source) = Config::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.window.width, 640);
        assert!(matches!(source, ConfigSource::File(p) if p == path));
    }
}

// Error taxonomy for the GPU core
//
// Four families: configuration, capability negotiation, transient
// surface state, and device loss. Only the transient family is
// recoverable; everything else aborts start-up or the session.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

use crate::requirements::RequirementIssue;

/// GPU core errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Malformed dependency declarations, caught before any hardware call.
    #[error("invalid requirements: {}", join_issues(.0))]
    InvalidRequirements(Vec<RequirementIssue>),

    /// Configuration value that cannot be turned into requirements.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The Vulkan loader could not be found or opened.
    #[error("failed to load the Vulkan library: {0}")]
    LoaderUnavailable(String),

    /// The windowing backend cannot create Vulkan surfaces.
    #[error("windowing backend does not support Vulkan presentation")]
    SurfaceUnsupported,

    /// The installed Vulkan implementation is older than required.
    #[error("Vulkan {required} required, loader only offers {available}")]
    UnsupportedApiVersion { required: String, available: String },

    /// No physical device satisfies the declared requirements.
    #[error("no suitable GPU found")]
    NoSuitableDevice,

    /// None of the requested surface formats is available.
    #[error("none of the requested surface formats is supported by the surface")]
    NoSurfaceFormat,

    /// No memory type matches the filter and property flags.
    #[error("no memory type matches filter {type_bits:#b} with properties {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// A format lacks required features under the requested tiling.
    #[error("format {format:?} with {tiling:?} tiling is missing features {missing:?}")]
    UnsupportedFormatFeatures {
        format: vk::Format,
        tiling: vk::ImageTiling,
        missing: vk::FormatFeatureFlags,
    },

    /// No candidate format supports the required features.
    #[error("no candidate format supports {required:?}")]
    NoSupportedFormat { required: vk::FormatFeatureFlags },

    /// Swapchain no longer matches the surface; recreate and retry.
    #[error("swapchain is out of date")]
    SwapchainOutOfDate,

    /// Unrecoverable hardware or driver failure.
    #[error("GPU device lost")]
    DeviceLost,

    /// Shader bytecode file does not exist.
    #[error("shader bytecode not found: {}", .0.display())]
    ShaderNotFound(PathBuf),

    /// Shader bytecode exists but is not valid SPIR-V.
    #[error("invalid SPIR-V in {}: {source}", .path.display())]
    InvalidShader {
        path: PathBuf,
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// API misuse or a resource in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            other => Self::Vulkan(other),
        }
    }
}

impl GpuError {
    /// Transient surface state: recreate the swapchain or skip the frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate)
    }

    /// Everything that is not recoverable ends start-up or the session.
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }
}

fn join_issues(issues: &[RequirementIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_maps_to_fatal_variant() {
        let err = GpuError::from(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, GpuError::DeviceLost));
        assert!(err.is_fatal());
    }

    #[test]
    fn out_of_date_is_recoverable() {
        let err = GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(err, GpuError::SwapchainOutOfDate));
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn other_results_are_kept_verbatim() {
        let err = GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(
            err,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
    }

    #[test]
    fn requirement_issues_are_listed_in_message() {
        let err = GpuError::InvalidRequirements(vec![
            RequirementIssue::ZeroApiVersion,
            RequirementIssue::TooFewSwapchainImages(1),
        ]);
        let message = err.to_string();
        assert!(message.contains("API version"));
        assert!(message.contains("; "));
    }
}

// Backend module - Vulkan abstraction layer
//
// Thin ownership wrappers around ash. Every object holds an Arc to the
// device that created it, so the device is always destroyed last.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod memory;
pub mod negotiator;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{BufferKind, BufferResource, CopyStrategy};
pub use device::{DeviceQueue, VulkanDevice};
pub use image::{ImageKind, ImageResource, ImageSpec};
pub use surface::SurfaceProvider;
pub use swapchain::Swapchain;

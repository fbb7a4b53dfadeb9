// Window surface boundary
//
// The window itself is an external collaborator; the core only needs
// the handful of calls in `SurfaceProvider`.

use ash::vk;
use std::os::raw::c_char;

use crate::error::Result;

/// What the core needs from a window.
pub trait SurfaceProvider {
    /// Current drawable size in physical pixels.
    fn pixel_extent(&self) -> vk::Extent2D;

    /// Whether this windowing backend can host a Vulkan surface.
    fn supports_vulkan(&self) -> bool;

    /// Instance extensions required to create the surface.
    fn required_extensions(&self) -> Result<Vec<*const c_char>>;

    /// Create the native surface.
    ///
    /// # Safety
    /// The instance must have been created with `required_extensions`
    /// and must outlive the returned surface.
    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR>;

    /// Returns true once after the window was resized. Polled, not pushed.
    fn take_resize(&self) -> bool;
}

/// A created surface together with its extension loader.
pub struct PresentSurface {
    pub loader: ash::extensions::khr::Surface,
    pub handle: vk::SurfaceKHR,
}

impl PresentSurface {
    /// # Safety
    /// Physical device and surface must be valid.
    pub unsafe fn supports_family(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
    ) -> Result<bool> {
        Ok(self
            .loader
            .get_physical_device_surface_support(physical_device, family, self.handle)?)
    }

    /// # Safety
    /// Physical device and surface must be valid.
    pub unsafe fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(self
            .loader
            .get_physical_device_surface_capabilities(physical_device, self.handle)?)
    }

    /// Capabilities, formats and present modes in one snapshot.
    ///
    /// # Safety
    /// Physical device and surface must be valid.
    pub unsafe fn snapshot(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSnapshot> {
        Ok(SurfaceSnapshot {
            capabilities: self.capabilities(physical_device)?,
            formats: self
                .loader
                .get_physical_device_surface_formats(physical_device, self.handle)?,
            present_modes: self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)?,
        })
    }

    /// # Safety
    /// No swapchain created from this surface may still exist.
    pub unsafe fn destroy(&self) {
        self.loader.destroy_surface(self.handle, None);
    }
}

/// Hardware-reported surface state.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSnapshot {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

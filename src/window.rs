// winit-backed window surface
//
// Adapts a winit window to `SurfaceProvider`. Resize notifications from
// the event loop are latched in an atomic flag and polled by the renderer.

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::surface::SurfaceProvider;
use crate::error::Result;

pub struct WindowSurface {
    window: Arc<Window>,
    resized: AtomicBool,
}

impl WindowSurface {
    pub fn new(window: Arc<Window>) -> Self {
        Self {
            window,
            resized: AtomicBool::new(false),
        }
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Record that the window changed size; picked up on the next frame.
    pub fn notify_resized(&self) {
        self.resized.store(true, Ordering::Release);
    }
}

impl SurfaceProvider for WindowSurface {
    fn pixel_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn supports_vulkan(&self) -> bool {
        ash_window::enumerate_required_extensions(self.window.raw_display_handle()).is_ok()
    }

    fn required_extensions(&self) -> Result<Vec<*const c_char>> {
        let extensions =
            ash_window::enumerate_required_extensions(self.window.raw_display_handle())?;
        Ok(extensions.to_vec())
    }

    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        let surface = ash_window::create_surface(
            entry,
            instance,
            self.window.raw_display_handle(),
            self.window.raw_window_handle(),
            None,
        )?;
        Ok(surface)
    }

    fn take_resize(&self) -> bool {
        self.resized.swap(false, Ordering::AcqRel)
    }
}

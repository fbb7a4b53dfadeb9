// Swapchain - Window presentation
//
// Negotiates format, present mode, extent and image count against the
// surface, then creates and recreates the chain of presentable images.
// Negotiation lives in `SwapchainPlan` so it can be tested without a GPU.

use ash::vk;
use std::sync::Arc;

use super::image::ImageResource;
use super::VulkanDevice;
use crate::error::{GpuError, Result};
use crate::requirements::SwapchainRequirement;

use super::surface::SurfaceSnapshot;

/// Result of acquiring a presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of queueing a present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Present {
    Done,
    Suboptimal,
    OutOfDate,
}

/// What a capability poll found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    /// Degenerate extent; skip frame submission.
    Minimized,
    Ready,
    /// First usable extent after being minimized; recreate before drawing.
    Restored,
}

/// Usage every presentable image carries: frames are copied in from the
/// offscreen render target.
pub const PRESENT_COPY_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::TRANSFER_DST;

/// First candidate the surface offers. A surface that reports a single
/// UNDEFINED format accepts anything, so the first candidate is used.
pub fn select_surface_format(
    candidates: &[vk::SurfaceFormatKHR],
    available: &[vk::SurfaceFormatKHR],
) -> Result<vk::SurfaceFormatKHR> {
    if let [only] = available {
        if only.format == vk::Format::UNDEFINED {
            return candidates.first().copied().ok_or(GpuError::NoSurfaceFormat);
        }
    }

    candidates
        .iter()
        .copied()
        .find(|candidate| {
            available.iter().any(|a| {
                a.format == candidate.format && a.color_space == candidate.color_space
            })
        })
        .ok_or(GpuError::NoSurfaceFormat)
}

/// First candidate the surface offers, else FIFO (always available).
pub fn select_present_mode(
    candidates: &[vk::PresentModeKHR],
    available: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    candidates
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Surface extent, or the window extent clamped to the surface limits
/// when the surface leaves the choice to us.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Requested count clamped to what the surface allows (max 0 = unbounded).
pub fn choose_image_count(requested: u32, capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

pub fn is_degenerate(extent: vk::Extent2D) -> bool {
    extent.width <= 1 || extent.height <= 1
}

fn choose_composite_alpha(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&mode| capabilities.supported_composite_alpha.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Minimized/restored edge detection over successive polls.
#[derive(Debug, Default, Clone)]
pub struct MinimizeTracker {
    minimized: bool,
}

impl MinimizeTracker {
    pub fn observe(&mut self, extent: vk::Extent2D) -> SurfaceStatus {
        if is_degenerate(extent) {
            self.minimized = true;
            SurfaceStatus::Minimized
        } else if self.minimized {
            self.minimized = false;
            SurfaceStatus::Restored
        } else {
            SurfaceStatus::Ready
        }
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }
}

/// Negotiated swapchain settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    /// Count asked for by the requirements, kept across recreation.
    pub requested_image_count: u32,
    /// Count actually passed to the driver for the current surface.
    pub min_image_count: u32,
    pub usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl SwapchainPlan {
    pub fn negotiate(
        requirement: &SwapchainRequirement,
        snapshot: &SurfaceSnapshot,
        window_extent: vk::Extent2D,
    ) -> Result<Self> {
        let surface_format = select_surface_format(&requirement.formats, &snapshot.formats)?;
        let present_mode = select_present_mode(&requirement.present_modes, &snapshot.present_modes);

        let usage = requirement.usage() | PRESENT_COPY_USAGE;
        let supported = snapshot.capabilities.supported_usage_flags;
        if !supported.contains(usage) {
            log::error!("Surface usage {:?} lacks {:?}", supported, usage);
            return Err(GpuError::InvalidState(format!(
                "surface does not support image usage {:?}",
                usage & !supported
            )));
        }

        let capabilities = &snapshot.capabilities;
        Ok(Self {
            surface_format,
            present_mode,
            extent: choose_extent(capabilities, window_extent),
            requested_image_count: requirement.image_count,
            min_image_count: choose_image_count(requirement.image_count, capabilities),
            usage,
            pre_transform: capabilities.current_transform,
            composite_alpha: choose_composite_alpha(capabilities),
        })
    }

    /// Same format, present mode and requested count; extent and
    /// limits follow the freshly queried capabilities.
    pub fn refresh(
        &self,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        window_extent: vk::Extent2D,
    ) -> Self {
        Self {
            extent: choose_extent(capabilities, window_extent),
            min_image_count: choose_image_count(self.requested_image_count, capabilities),
            pre_transform: capabilities.current_transform,
            composite_alpha: choose_composite_alpha(capabilities),
            ..*self
        }
    }
}

pub struct Swapchain {
    loader: ash::extensions::khr::Swapchain,
    handle: vk::SwapchainKHR,
    images: Vec<ImageResource>,
    plan: SwapchainPlan,
    tracker: MinimizeTracker,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        requirement: &SwapchainRequirement,
        window_extent: vk::Extent2D,
    ) -> Result<Self> {
        let surface = device
            .surface()
            .ok_or_else(|| GpuError::InvalidState("device was created without a surface".into()))?;
        let snapshot = unsafe { surface.snapshot(device.physical_device) }?;

        let plan = SwapchainPlan::negotiate(requirement, &snapshot, window_extent)?;
        log::info!(
            "Swapchain format {:?}/{:?}, present mode {:?}",
            plan.surface_format.format,
            plan.surface_format.color_space,
            plan.present_mode
        );

        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);
        let mut swapchain = Self {
            loader,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            plan,
            tracker: MinimizeTracker::default(),
            device,
        };

        if swapchain.tracker.observe(plan.extent) == SurfaceStatus::Minimized {
            log::info!("Surface is minimized; deferring swapchain creation");
            return Ok(swapchain);
        }

        swapchain.build()?;
        Ok(swapchain)
    }

    /// Create a new swapchain from `self.plan`, handing the current one
    /// over as `old_swapchain` and destroying it afterwards.
    fn build(&mut self) -> Result<()> {
        let surface = self
            .device
            .surface()
            .ok_or_else(|| GpuError::InvalidState("device was created without a surface".into()))?;
        let plan = self.plan;
        let old = self.handle;

        log::info!(
            "Creating swapchain: {}x{} ({} images requested)",
            plan.extent.width,
            plan.extent.height,
            plan.min_image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(plan.min_image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(plan.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(plan.pre_transform)
            .composite_alpha(plan.composite_alpha)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe { self.loader.create_swapchain(&create_info, None) }?;

        // The old handle is retired by the create call; free it now
        if old != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old, None) };
        }
        self.handle = handle;

        let raw_images = unsafe { self.loader.get_swapchain_images(handle) }?;
        let mut images = Vec::with_capacity(raw_images.len());
        for raw in raw_images {
            // Already-built views are closed by their Drop on early return
            images.push(ImageResource::presentable(
                &self.device,
                raw,
                plan.surface_format.format,
                plan.extent,
                plan.usage,
            )?);
        }
        self.images = images;

        log::info!("Created swapchain with {} images", self.images.len());
        Ok(())
    }

    /// Tear down presentable views, re-query the surface and rebuild.
    /// Returns `Minimized` without creating anything while the surface
    /// is degenerate.
    pub fn recreate(&mut self, window_extent: vk::Extent2D) -> Result<SurfaceStatus> {
        for image in &mut self.images {
            image.close();
        }
        self.images.clear();

        let capabilities = self.capabilities()?;
        self.plan = self.plan.refresh(&capabilities, window_extent);

        let status = self.tracker.observe(self.plan.extent);
        if status == SurfaceStatus::Minimized {
            log::debug!("Swapchain recreation deferred: surface minimized");
            return Ok(status);
        }

        self.build()?;
        Ok(status)
    }

    /// Re-query surface capabilities and classify the extent.
    pub fn poll(&mut self, window_extent: vk::Extent2D) -> Result<SurfaceStatus> {
        let capabilities = self.capabilities()?;
        Ok(self.tracker.observe(choose_extent(&capabilities, window_extent)))
    }

    fn capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        let surface = self
            .device
            .surface()
            .ok_or_else(|| GpuError::InvalidState("device was created without a surface".into()))?;
        unsafe { surface.capabilities(self.device.physical_device) }
    }

    /// Acquire next image for rendering
    pub fn acquire(&self, semaphore: vk::Semaphore) -> Result<Acquire> {
        if self.handle == vk::SwapchainKHR::null() {
            return Ok(Acquire::OutOfDate);
        }

        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<Present> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(Present::Done),
            Ok(true) => Ok(Present::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_minimized(&self) -> bool {
        self.tracker.is_minimized()
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[ImageResource] {
        &self.images
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn plan(&self) -> &SwapchainPlan {
        &self.plan
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    pub fn format(&self) -> vk::Format {
        self.plan.surface_format.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.plan.present_mode
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Views first; the images themselves belong to the swapchain
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.handle, None) };
        }
    }
}

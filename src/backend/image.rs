// Image resources
//
// One owning type for every image the renderer touches. Presentable
// images borrow their handle and memory from the swapchain; depth and
// render-target images own both. Teardown order is fixed here:
// framebuffer -> view -> image -> memory.

use ash::vk;
use std::sync::Arc;

use super::memory::{aspect_for_format, check_format_features};
use super::VulkanDevice;
use crate::error::{GpuError, Result};

/// Lifecycle class of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Owned by the swapchain; only the view is ours.
    Presentable,
    Depth,
    RenderTarget,
}

/// Creation parameters for an owned image.
#[derive(Debug, Clone, Copy)]
pub struct ImageSpec {
    pub kind: ImageKind,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    /// Format features that must be present for `format` under `tiling`.
    pub features: vk::FormatFeatureFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
}

impl ImageSpec {
    pub fn depth(format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            kind: ImageKind::Depth,
            format,
            extent,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// Offscreen color target that is later copied into a presentable image.
    pub fn render_target(
        format: vk::Format,
        extent: vk::Extent2D,
        features: vk::FormatFeatureFlags,
    ) -> Self {
        Self {
            kind: ImageKind::RenderTarget,
            format,
            extent,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            features,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }
}

pub struct ImageResource {
    kind: ImageKind,
    handle: vk::Image,
    memory: Option<vk::DeviceMemory>,
    view: vk::ImageView,
    framebuffer: Option<vk::Framebuffer>,
    format: vk::Format,
    extent: vk::Extent2D,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
    closed: bool,
    device: Arc<VulkanDevice>,
}

impl ImageResource {
    /// Create an owned depth or render-target image.
    pub fn create(device: &Arc<VulkanDevice>, spec: &ImageSpec) -> Result<Self> {
        if spec.kind == ImageKind::Presentable {
            return Err(GpuError::InvalidState(
                "presentable images come from the swapchain".into(),
            ));
        }

        let format_properties = device.format_properties(spec.format);
        check_format_features(spec.format, spec.tiling, &format_properties, spec.features)?;

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: spec.extent.width,
                height: spec.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(spec.format)
            .tiling(spec.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(spec.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = &device.device;
        let handle = unsafe { raw.create_image(&image_info, None) }?;

        let memory = match Self::allocate_and_bind(device, handle, spec.memory_flags) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { raw.destroy_image(handle, None) };
                return Err(e);
            }
        };

        let aspect = aspect_for_format(spec.format);
        let view = match create_view(raw, handle, spec.format, aspect) {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    raw.destroy_image(handle, None);
                    raw.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        log::debug!(
            "Created {:?} image {}x{} ({:?})",
            spec.kind,
            spec.extent.width,
            spec.extent.height,
            spec.format
        );

        Ok(Self {
            kind: spec.kind,
            handle,
            memory: Some(memory),
            view,
            framebuffer: None,
            format: spec.format,
            extent: spec.extent,
            tiling: spec.tiling,
            usage: spec.usage,
            aspect,
            closed: false,
            device: device.clone(),
        })
    }

    /// Wrap a swapchain-owned image; only the view is created here.
    pub fn presentable(
        device: &Arc<VulkanDevice>,
        handle: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let aspect = vk::ImageAspectFlags::COLOR;
        let view = create_view(&device.device, handle, format, aspect)?;
        Ok(Self {
            kind: ImageKind::Presentable,
            handle,
            memory: None,
            view,
            framebuffer: None,
            format,
            extent,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            aspect,
            closed: false,
            device: device.clone(),
        })
    }

    fn allocate_and_bind(
        device: &VulkanDevice,
        image: vk::Image,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let memory_type_index = device.find_memory_type(requirements.memory_type_bits, flags)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }?;
        if let Err(e) = unsafe { device.device.bind_image_memory(image, memory, 0) } {
            unsafe { device.device.free_memory(memory, None) };
            return Err(e.into());
        }
        Ok(memory)
    }

    /// Create this image's framebuffer with `depth` as second attachment.
    /// A render target cannot exist before its depth image.
    pub fn attach_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        depth: &ImageResource,
    ) -> Result<()> {
        if depth.kind != ImageKind::Depth || depth.closed {
            return Err(GpuError::InvalidState(
                "framebuffer needs a live depth image".into(),
            ));
        }
        if self.closed {
            return Err(GpuError::InvalidState("image already closed".into()));
        }
        if depth.extent != self.extent {
            return Err(GpuError::InvalidState(format!(
                "depth extent {:?} does not match image extent {:?}",
                depth.extent, self.extent
            )));
        }

        let attachments = [self.view, depth.view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(1);

        let framebuffer = unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }?;
        if let Some(old) = self.framebuffer.replace(framebuffer) {
            unsafe { self.device.device.destroy_framebuffer(old, None) };
        }
        Ok(())
    }

    /// Release everything this image owns. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let device = &self.device.device;
        unsafe {
            if let Some(framebuffer) = self.framebuffer.take() {
                device.destroy_framebuffer(framebuffer, None);
            }
            device.destroy_image_view(self.view, None);
            if self.kind != ImageKind::Presentable {
                device.destroy_image(self.handle, None);
                if let Some(memory) = self.memory.take() {
                    device.free_memory(memory, None);
                }
            }
        }
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn framebuffer(&self) -> Option<vk::Framebuffer> {
        self.framebuffer
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn tiling(&self) -> vk::ImageTiling {
        self.tiling
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ImageResource {
    fn drop(&mut self) {
        self.close();
    }
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = unsafe { device.create_image_view(&view_info, None) }?;
    Ok(view)
}

// Command recording and submission
//
// Pools are reset rather than recreated when command buffers need
// re-recording. Each swapchain image owns a render buffer and a copy
// buffer, both from the graphics family since the copy pass feeds
// presentation.

use ash::vk;
use std::sync::Arc;

use super::pipeline::PipelineState;
use super::VulkanDevice;
use crate::error::Result;

/// Command pool bound to one queue family.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(
        device: &Arc<VulkanDevice>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.device.create_command_pool(&create_info, None) }?;
        Ok(Self {
            pool,
            queue_family,
            device: device.clone(),
        })
    }

    /// Pool for short-lived upload/read-back commands.
    pub fn transient(device: &Arc<VulkanDevice>, queue_family: u32) -> Result<Self> {
        Self::new(device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }?;
        Ok(buffers)
    }

    /// Reset every buffer allocated from this pool back to the initial state.
    ///
    /// None of them may be pending on a queue.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
        }?;
        Ok(())
    }

    /// Record with `f`, submit to `queue` and block until the queue is idle.
    pub fn submit_one_shot<F>(&self, queue: vk::Queue, f: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;
        let cmd = self
            .allocate(1)?
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;

        let result = unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info).and_then(|_| {
                f(device, cmd);
                device.end_command_buffer(cmd)?;

                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                device.queue_submit(queue, &[submit_info.build()], vk::Fence::null())?;
                device.queue_wait_idle(queue)
            })
        };

        unsafe { device.free_command_buffers(self.pool, &[cmd]) };
        result?;
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

/// Everything one draw frame references.
pub struct DrawFrame<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub pipeline: &'a PipelineState,
    pub descriptor_set: vk::DescriptorSet,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
}

/// Clear values for the color and depth attachments, in attachment order.
pub fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

/// Record render pass begin → bind → draw-indexed → end.
///
/// # Safety
/// `cmd` must be in the initial state and every handle in `frame` valid.
pub unsafe fn record_draw(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    frame: &DrawFrame<'_>,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder();
    device.begin_command_buffer(cmd, &begin_info)?;

    let clear_values = clear_values(frame.clear_color);
    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(frame.render_pass)
        .framebuffer(frame.framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: frame.extent,
        })
        .clear_values(&clear_values);

    device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

    device.cmd_bind_pipeline(
        cmd,
        vk::PipelineBindPoint::GRAPHICS,
        frame.pipeline.pipeline,
    );
    device.cmd_set_viewport(cmd, 0, &[frame.pipeline.viewport]);
    device.cmd_set_scissor(cmd, 0, &[frame.pipeline.scissor]);
    device.cmd_bind_vertex_buffers(cmd, 0, &[frame.vertex_buffer], &[0]);
    device.cmd_bind_index_buffer(cmd, frame.index_buffer, 0, vk::IndexType::UINT32);
    device.cmd_bind_descriptor_sets(
        cmd,
        vk::PipelineBindPoint::GRAPHICS,
        frame.pipeline.layout,
        0,
        &[frame.descriptor_set],
        &[],
    );
    device.cmd_draw_indexed(cmd, frame.index_count, 1, 0, 0, 0);

    device.cmd_end_render_pass(cmd);
    device.end_command_buffer(cmd)?;
    Ok(())
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Barriers around the render-target → presentable copy: the pair issued
/// before the copy, and the one moving the presentable image to present.
pub fn presentation_barriers(
    render_target: vk::Image,
    presentable: vk::Image,
) -> ([vk::ImageMemoryBarrier; 2], vk::ImageMemoryBarrier) {
    let to_source = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
        .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(render_target)
        .subresource_range(color_range())
        .build();

    // Previous contents are irrelevant; the copy overwrites everything
    let to_destination = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(presentable)
        .subresource_range(color_range())
        .build();

    let to_present = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(presentable)
        .subresource_range(color_range())
        .build();

    ([to_source, to_destination], to_present)
}

/// Record the copy of a finished render target into a presentable image.
///
/// # Safety
/// `cmd` must be in the initial state; both images must be live and
/// share `extent`.
pub unsafe fn record_copy_to_present(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    render_target: vk::Image,
    presentable: vk::Image,
    extent: vk::Extent2D,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder();
    device.begin_command_buffer(cmd, &begin_info)?;

    let (before, after) = presentation_barriers(render_target, presentable);
    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::TRANSFER,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &before,
    );

    let layers = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    let region = vk::ImageCopy::builder()
        .src_subresource(layers)
        .dst_subresource(layers)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .build();

    device.cmd_copy_image(
        cmd,
        render_target,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        presentable,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[region],
    );

    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[after],
    );

    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Per-image render and copy command buffers.
pub struct ImageCommands {
    pub render: vk::CommandBuffer,
    pub copy: vk::CommandBuffer,
    pool: CommandPool,
    dirty: bool,
}

/// Command buffers for every swapchain image, re-recorded lazily.
pub struct CommandRecorder {
    images: Vec<ImageCommands>,
}

impl CommandRecorder {
    pub fn new(device: &Arc<VulkanDevice>, queue_family: u32, image_count: usize) -> Result<Self> {
        let mut images = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            let pool = CommandPool::new(device, queue_family, vk::CommandPoolCreateFlags::empty())?;
            let buffers = pool.allocate(2)?;
            images.push(ImageCommands {
                render: buffers[0],
                copy: buffers[1],
                pool,
                dirty: true,
            });
        }
        log::debug!("Allocated command buffers for {} images", image_count);
        Ok(Self { images })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, image_index: usize) -> Option<&ImageCommands> {
        self.images.get(image_index)
    }

    pub fn is_dirty(&self, image_index: usize) -> bool {
        self.images.get(image_index).map_or(false, |c| c.dirty)
    }

    pub fn mark_all_dirty(&mut self) {
        for commands in &mut self.images {
            commands.dirty = true;
        }
    }

    /// Reset the image's pool and re-record both buffers with `record`.
    /// The image's previous submission must have completed.
    pub fn rerecord<F>(&mut self, image_index: usize, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer, vk::CommandBuffer) -> Result<()>,
    {
        let commands = self.images.get_mut(image_index).ok_or_else(|| {
            crate::error::GpuError::InvalidState(format!("no command buffers for image {image_index}"))
        })?;
        commands.pool.reset()?;
        record(commands.render, commands.copy)?;
        commands.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn copy_barriers_move_images_through_transfer_layouts() {
        let rt = vk::Image::from_raw(1);
        let present = vk::Image::from_raw(2);
        let ([to_source, to_destination], to_present) = presentation_barriers(rt, present);

        assert_eq!(to_source.image, rt);
        assert_eq!(to_source.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(to_source.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

        assert_eq!(to_destination.image, present);
        assert_eq!(to_destination.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(to_destination.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        assert_eq!(to_present.image, present);
        assert_eq!(to_present.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(to_present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn clear_values_are_color_then_depth() {
        let values = clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(values[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(values[1].depth_stencil.depth, 1.0);
        }
    }
}

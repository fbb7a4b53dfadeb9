// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// PipelineState owns everything a draw binds and is rebuilt wholesale when
// shaders or the vertex layout change.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::ffi::CStr;
use std::mem::{offset_of, size_of};
use std::path::PathBuf;
use std::sync::Arc;

use super::buffer::BufferResource;
use super::descriptor::{self, DescriptorSets};
use super::shader;
use super::VulkanDevice;
use crate::error::Result;

/// Interleaved mesh vertex: position then color.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(position: [f32; 3], color: [f32; 3]) -> Self {
        Self { position, color }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            // Position attribute (location 0)
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, position) as u32)
                .build(),
            // Color attribute (location 1)
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, color) as u32)
                .build(),
        ]
    }
}

/// Compiled shader locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderPaths {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

/// Render pass: offscreen color target plus depth.
///
/// The color attachment ends in COLOR_ATTACHMENT_OPTIMAL; the copy pass
/// moves it to TRANSFER_SRC_OPTIMAL itself.
pub fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    // Color attachment (the render target)
    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    // Depth attachment
    let depth_attachment = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    // Single subpass with color and depth
    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    // The previous frame's copy reads the render target, and the shared
    // depth image is written by every frame
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags::TRANSFER,
        )
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = &[color_attachment, depth_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    let render_pass = unsafe { device.create_render_pass(&render_pass_info, None) }?;
    Ok(render_pass)
}

/// Owned render pass handle.
pub struct RenderPass {
    handle: vk::RenderPass,
    device: Arc<VulkanDevice>,
}

impl RenderPass {
    pub fn new(
        device: &Arc<VulkanDevice>,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<Self> {
        let handle = create_render_pass(&device.device, color_format, depth_format)?;
        Ok(Self {
            handle,
            device: device.clone(),
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_render_pass(self.handle, None) };
    }
}

/// Full-extent viewport with the standard depth range.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Everything a draw binds, owned together.
pub struct PipelineState {
    pub set_layout: vk::DescriptorSetLayout,
    pub descriptors: DescriptorSets,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
}

/// Objects created so far during a build, released on failure.
#[derive(Default)]
struct Partial {
    modules: Vec<vk::ShaderModule>,
    set_layout: Option<vk::DescriptorSetLayout>,
    descriptors: Option<DescriptorSets>,
    layout: Option<vk::PipelineLayout>,
}

impl Partial {
    fn destroy_modules(&mut self, device: &ash::Device) {
        for module in self.modules.drain(..) {
            unsafe { device.destroy_shader_module(module, None) };
        }
    }

    fn release(mut self, device: &ash::Device) {
        self.destroy_modules(device);
        unsafe {
            if let Some(layout) = self.layout.take() {
                device.destroy_pipeline_layout(layout, None);
            }
            if let Some(descriptors) = self.descriptors.take() {
                descriptors.destroy(device);
            }
            if let Some(set_layout) = self.set_layout.take() {
                device.destroy_descriptor_set_layout(set_layout, None);
            }
        }
    }
}

impl PipelineState {
    /// Build layout, descriptor sets and pipeline. Anything created before
    /// a failing step is destroyed before the error is returned.
    pub fn new(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        shaders: &ShaderPaths,
        uniforms: &[BufferResource],
    ) -> Result<Self> {
        let mut partial = Partial::default();
        match Self::build(device, render_pass, shaders, uniforms, &mut partial) {
            Ok(pipeline) => {
                partial.destroy_modules(device);
                let state = Self {
                    set_layout: partial.set_layout.take().unwrap_or_default(),
                    descriptors: partial.descriptors.take().unwrap_or(DescriptorSets {
                        pool: vk::DescriptorPool::null(),
                        sets: Vec::new(),
                    }),
                    layout: partial.layout.take().unwrap_or_default(),
                    pipeline,
                    viewport: full_viewport(extent),
                    scissor: full_scissor(extent),
                };
                log::info!("Built graphics pipeline for {}x{}", extent.width, extent.height);
                Ok(state)
            }
            Err(e) => {
                log::error!("Pipeline creation failed: {}", e);
                partial.release(device);
                Err(e)
            }
        }
    }

    fn build(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        shaders: &ShaderPaths,
        uniforms: &[BufferResource],
        partial: &mut Partial,
    ) -> Result<vk::Pipeline> {
        let vert_shader = shader::load_shader_module(device, &shaders.vertex)?;
        partial.modules.push(vert_shader);
        let frag_shader = shader::load_shader_module(device, &shaders.fragment)?;
        partial.modules.push(frag_shader);

        let set_layout = descriptor::create_set_layout(device)?;
        partial.set_layout = Some(set_layout);
        partial.descriptors = Some(DescriptorSets::new(device, set_layout, uniforms)?);

        // Pipeline layout
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }?;
        partial.layout = Some(pipeline_layout);

        // Shader stages
        let entry_point: &CStr = c"main";
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_shader)
                .name(entry_point)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_shader)
                .name(entry_point)
                .build(),
        ];

        // Vertex input
        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are set at record time
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS) // Closer objects win
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Opaque
        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
        }?;

        Ok(pipelines[0])
    }

    pub fn descriptor_set(&self, image_index: usize) -> Option<vk::DescriptorSet> {
        self.descriptors.sets.get(image_index).copied()
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            self.descriptors.destroy(device);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_struct() {
        assert_eq!(size_of::<Vertex>(), 24);
        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 24);

        let [position, color] = Vertex::attribute_descriptions();
        assert_eq!((position.location, position.offset), (0, 0));
        assert_eq!((color.location, color.offset), (1, 12));
        assert_eq!(color.format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn vertices_cast_to_bytes() {
        let vertices = [
            Vertex::new([0.0, 1.0, 2.0], [1.0, 0.0, 0.0]),
            Vertex::new([3.0, 4.0, 5.0], [0.0, 1.0, 0.0]),
        ];
        let bytes: &[u8] = bytemuck::cast_slice(&vertices);
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[12..16], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn viewport_covers_extent() {
        let extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        let viewport = full_viewport(extent);
        assert_eq!((viewport.width, viewport.height), (640.0, 480.0));
        assert_eq!(viewport.max_depth, 1.0);
        assert_eq!(full_scissor(extent).extent, extent);
    }
}

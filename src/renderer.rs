// Renderer - ties the backend together behind the frame pacer
//
// `VulkanBackend` is the one production `FrameBackend`. It owns every
// device object; field order is drop order, with the device last.
//
// Frame submission: render batch (waits image-available, signals
// render-finished) and copy batch (waits render-finished, signals
// copy-finished) go to the graphics queue in one vkQueueSubmit, so the
// slot fence covers both. Present waits on copy-finished.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::sync::Arc;

use crate::backend::buffer::{BufferResource, CopyStrategy};
use crate::backend::command::{self, CommandPool, CommandRecorder, DrawFrame};
use crate::backend::image::{ImageResource, ImageSpec};
use crate::backend::memory::select_supported_format;
use crate::backend::pipeline::{full_scissor, full_viewport, PipelineState, RenderPass, ShaderPaths, Vertex};
use crate::backend::surface::SurfaceProvider;
use crate::backend::swapchain::{Acquire, Present, SurfaceStatus, Swapchain};
use crate::backend::sync::FrameSyncSet;
use crate::backend::VulkanDevice;
use crate::error::{GpuError, Result};
use crate::hot_reload::ShaderWatcher;
use crate::pacer::{FrameBackend, FrameOutcome, FramePacer};
use crate::requirements::Requirements;

/// Construction options that are not hardware requirements.
#[derive(Debug, Clone)]
pub struct RendererOptions {
    pub app_name: String,
    pub enable_validation: bool,
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub shaders: ShaderPaths,
    pub hot_reload: bool,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            app_name: "vkframe".to_string(),
            enable_validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            shaders: ShaderPaths {
                vertex: "shaders/mesh.vert.spv".into(),
                fragment: "shaders/mesh.frag.spv".into(),
            },
            hot_reload: false,
        }
    }
}

/// Uniform block read by the mesh vertex shader (binding 0).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshUniforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl Default for MeshUniforms {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        }
    }
}

/// Indexed triangle list uploaded once at start-up.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

pub struct VulkanBackend {
    watcher: Option<ShaderWatcher>,
    frame_sync: FrameSyncSet,
    recorder: CommandRecorder,
    pipeline: Option<PipelineState>,
    // Render targets hold framebuffers referencing depth; drop them first
    render_targets: Vec<ImageResource>,
    depth: Option<ImageResource>,
    render_pass: RenderPass,
    uniforms: Vec<BufferResource>,
    vertex_buffer: BufferResource,
    index_buffer: BufferResource,
    swapchain: Swapchain,

    uniform_data: MeshUniforms,
    depth_format: vk::Format,
    render_target_features: vk::FormatFeatureFlags,
    clear_color: [f32; 4],
    shaders: ShaderPaths,
    window: Arc<dyn SurfaceProvider>,
    device: Arc<VulkanDevice>,
}

impl VulkanBackend {
    pub fn new(
        options: &RendererOptions,
        requirements: &Requirements,
        window: Arc<dyn SurfaceProvider>,
        mesh: &Mesh,
    ) -> Result<Self> {
        let device = VulkanDevice::new(
            &options.app_name,
            requirements,
            options.enable_validation,
            window.as_ref(),
        )?;

        let swapchain = Swapchain::new(device.clone(), &requirements.swapchain, window.pixel_extent())?;

        let depth_format = select_supported_format(
            &requirements.depth.candidates,
            requirements.depth.tiling,
            requirements.depth.features,
            |format| device.format_properties(format),
        )?;
        log::info!("Depth format: {:?}", depth_format);

        let render_pass = RenderPass::new(&device, swapchain.format(), depth_format)?;

        // Mesh data goes to device-local memory through the transfer queue
        let transfer = device.transfer_queue();
        let upload_pool = CommandPool::transient(&device, transfer.family)?;
        let staged = CopyStrategy::Staged {
            queue: &transfer,
            pool: &upload_pool,
        };
        let vertex_buffer = BufferResource::from_slice(
            &device,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
            staged,
        )?;
        let index_buffer = BufferResource::from_slice(
            &device,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
            staged,
        )?;
        drop(upload_pool);

        let frame_sync = FrameSyncSet::new(&device, options.frames_in_flight)?;
        let recorder = CommandRecorder::new(&device, device.graphics_queue().family, 0)?;

        let watcher = if options.hot_reload {
            let paths = [options.shaders.vertex.clone(), options.shaders.fragment.clone()];
            match ShaderWatcher::new(&paths) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("Shader hot reload disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut backend = Self {
            watcher,
            frame_sync,
            recorder,
            pipeline: None,
            render_targets: Vec::new(),
            depth: None,
            render_pass,
            uniforms: Vec::new(),
            vertex_buffer,
            index_buffer,
            swapchain,
            uniform_data: MeshUniforms::default(),
            depth_format,
            render_target_features: requirements.render_target_features,
            clear_color: options.clear_color,
            shaders: options.shaders.clone(),
            window,
            device,
        };

        if !backend.swapchain.is_minimized() {
            backend.rebuild_surface_resources()?;
        }

        Ok(backend)
    }

    /// Depth, render targets, per-image uniforms, pipeline and command
    /// buffers for the current swapchain. Depth comes first: render-target
    /// framebuffers attach it.
    fn rebuild_surface_resources(&mut self) -> Result<()> {
        let extent = self.swapchain.extent();
        let format = self.swapchain.format();
        let image_count = self.swapchain.image_count();

        self.render_targets.clear();
        self.depth = None;

        let depth = ImageResource::create(&self.device, &ImageSpec::depth(self.depth_format, extent))?;

        let mut render_targets = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            let spec = ImageSpec::render_target(format, extent, self.render_target_features);
            let mut target = ImageResource::create(&self.device, &spec)?;
            target.attach_framebuffer(self.render_pass.handle(), &depth)?;
            render_targets.push(target);
        }
        self.depth = Some(depth);
        self.render_targets = render_targets;

        if self.uniforms.len() != image_count || self.pipeline.is_none() {
            // Descriptor sets point at the uniform buffers, so both go together
            if let Some(old) = self.pipeline.take() {
                old.destroy(&self.device.device);
            }
            self.uniforms.clear();
            for _ in 0..image_count {
                let uniform = BufferResource::host_visible(
                    &self.device,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    std::mem::size_of::<MeshUniforms>() as vk::DeviceSize,
                )?;
                uniform.write_pod(&self.uniform_data)?;
                self.uniforms.push(uniform);
            }
            self.pipeline = Some(PipelineState::new(
                &self.device.device,
                self.render_pass.handle(),
                extent,
                &self.shaders,
                &self.uniforms,
            )?);
        } else if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.viewport = full_viewport(extent);
            pipeline.scissor = full_scissor(extent);
        }

        if self.recorder.len() != image_count {
            self.recorder = CommandRecorder::new(&self.device, self.device.graphics_queue().family, image_count)?;
        }
        self.recorder.mark_all_dirty();

        log::info!(
            "Surface resources ready: {}x{}, {} images",
            extent.width,
            extent.height,
            image_count
        );
        Ok(())
    }

    /// Rebuild the pipeline if a watched shader changed. A shader that
    /// fails to load leaves the current pipeline in place.
    pub fn reload_changed_shaders(&mut self) -> Result<()> {
        // Changes stay queued while there is nothing to build against
        if self.uniforms.is_empty() || self.swapchain.is_minimized() {
            return Ok(());
        }
        let changed = match &self.watcher {
            Some(watcher) => watcher.take_changed(),
            None => return Ok(()),
        };
        if changed.is_empty() {
            return Ok(());
        }
        for path in &changed {
            log::info!("Shader changed: {}", path.display());
        }
        self.reload_shaders()
    }

    pub fn reload_shaders(&mut self) -> Result<()> {
        if self.uniforms.is_empty() {
            return Ok(());
        }
        self.device.wait_idle()?;
        match PipelineState::new(
            &self.device.device,
            self.render_pass.handle(),
            self.swapchain.extent(),
            &self.shaders,
            &self.uniforms,
        ) {
            Ok(pipeline) => {
                if let Some(old) = self.pipeline.replace(pipeline) {
                    old.destroy(&self.device.device);
                }
                self.recorder.mark_all_dirty();
                log::info!("Shaders reloaded");
            }
            Err(e) => log::error!("Shader reload failed, keeping previous pipeline: {}", e),
        }
        Ok(())
    }

    fn record_image(&mut self, image_index: usize) -> Result<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("no pipeline".into()))?;
        let target = self
            .render_targets
            .get(image_index)
            .ok_or_else(|| GpuError::InvalidState(format!("no render target for image {image_index}")))?;
        let presentable = self
            .swapchain
            .images()
            .get(image_index)
            .ok_or_else(|| GpuError::InvalidState(format!("no presentable image {image_index}")))?;
        let framebuffer = target
            .framebuffer()
            .ok_or_else(|| GpuError::InvalidState("render target has no framebuffer".into()))?;
        let descriptor_set = pipeline
            .descriptor_set(image_index)
            .ok_or_else(|| GpuError::InvalidState(format!("no descriptor set for image {image_index}")))?;

        let frame = DrawFrame {
            render_pass: self.render_pass.handle(),
            framebuffer,
            extent: target.extent(),
            clear_color: self.clear_color,
            pipeline,
            descriptor_set,
            vertex_buffer: self.vertex_buffer.handle(),
            index_buffer: self.index_buffer.handle(),
            index_count: self.index_buffer.element_count(),
        };
        let device = &self.device.device;
        let (source, destination) = (target.handle(), presentable.handle());

        self.recorder.rerecord(image_index, |render, copy| unsafe {
            command::record_draw(device, render, &frame)?;
            command::record_copy_to_present(device, copy, source, destination, frame.extent)
        })?;
        log::trace!("Re-recorded commands for image {}", image_index);
        Ok(())
    }

    pub fn set_uniforms(&mut self, uniforms: &MeshUniforms) {
        self.uniform_data = *uniforms;
    }

    pub fn window(&self) -> &Arc<dyn SurfaceProvider> {
        &self.window
    }
}

impl FrameBackend for VulkanBackend {
    fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    fn poll_surface(&mut self) -> Result<SurfaceStatus> {
        self.swapchain.poll(self.window.pixel_extent())
    }

    fn recreate(&mut self) -> Result<SurfaceStatus> {
        self.device.wait_idle()?;
        let status = self.swapchain.recreate(self.window.pixel_extent())?;
        if status != SurfaceStatus::Minimized {
            self.rebuild_surface_resources()?;
        }
        Ok(status)
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.frame_sync.wait(slot)
    }

    fn acquire(&mut self, slot: usize) -> Result<Acquire> {
        self.swapchain.acquire(self.frame_sync.get(slot).image_available)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.frame_sync.reset(slot)
    }

    fn prepare_image(&mut self, _slot: usize, image_index: u32) -> Result<()> {
        let image = image_index as usize;
        if let Some(uniform) = self.uniforms.get(image) {
            uniform.write_pod(&self.uniform_data)?;
        }
        if self.recorder.is_dirty(image) {
            self.record_image(image)?;
        }
        Ok(())
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let sync = self.frame_sync.get(slot);
        let commands = self
            .recorder
            .get(image_index as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("no commands for image {image_index}")))?;

        let render_wait = [sync.image_available];
        let render_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let render_buffers = [commands.render];
        let render_signal = [sync.render_finished];

        let copy_wait = [sync.render_finished];
        let copy_stages = [vk::PipelineStageFlags::TRANSFER];
        let copy_buffers = [commands.copy];
        let copy_signal = [sync.copy_finished];

        let submits = [
            vk::SubmitInfo::builder()
                .wait_semaphores(&render_wait)
                .wait_dst_stage_mask(&render_stages)
                .command_buffers(&render_buffers)
                .signal_semaphores(&render_signal)
                .build(),
            vk::SubmitInfo::builder()
                .wait_semaphores(&copy_wait)
                .wait_dst_stage_mask(&copy_stages)
                .command_buffers(&copy_buffers)
                .signal_semaphores(&copy_signal)
                .build(),
        ];

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue().handle,
                &submits,
                sync.in_flight_fence,
            )
        }?;
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<Present> {
        let wait = [self.frame_sync.get(slot).copy_finished];
        self.swapchain
            .present(self.device.graphics_queue().handle, image_index, &wait)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.destroy(&self.device.device);
        }
        // Remaining fields drop in declaration order
    }
}

/// Public face of the core: a frame pacer driving the Vulkan backend.
pub struct Renderer {
    pacer: FramePacer,
    backend: VulkanBackend,
}

impl Renderer {
    pub fn new(
        options: &RendererOptions,
        requirements: &Requirements,
        window: Arc<dyn SurfaceProvider>,
        mesh: &Mesh,
    ) -> Result<Self> {
        let pacer = FramePacer::new(options.frames_in_flight)?;
        let backend = VulkanBackend::new(options, requirements, window, mesh).map_err(|e| {
            log::error!("Renderer initialisation failed: {}", e);
            e
        })?;
        Ok(Self { pacer, backend })
    }

    /// Render one frame, or skip it while the window is minimized.
    pub fn render(&mut self) -> Result<FrameOutcome> {
        if self.backend.window.take_resize() {
            self.pacer.request_recreate();
        }
        self.backend.reload_changed_shaders()?;

        self.pacer.run_frame(&mut self.backend).map_err(|e| {
            if e.is_fatal() {
                log::error!("Fatal GPU error: {}", e);
            }
            e
        })
    }

    pub fn set_uniforms(&mut self, uniforms: &MeshUniforms) {
        self.backend.set_uniforms(uniforms);
    }

    /// Recreate the swapchain before the next frame.
    pub fn request_resize(&mut self) {
        self.pacer.request_recreate();
    }

    pub fn reload_shaders(&mut self) -> Result<()> {
        self.backend.reload_shaders()
    }

    pub fn is_minimized(&self) -> bool {
        self.pacer.is_minimized() || self.backend.swapchain.is_minimized()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.backend.swapchain.extent()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.pacer.frames_in_flight()
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.backend.device
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.backend.device.wait_idle()
    }
}

// Descriptor layout, pool and per-image sets
//
// The mesh pipeline reads one uniform buffer at binding 0 from the
// vertex stage. Each swapchain image gets its own set pointing at its
// own uniform buffer so writes never touch a buffer still in flight.

use ash::vk;

use super::buffer::BufferResource;
use crate::error::Result;

pub const UNIFORM_BINDING: u32 = 0;

pub fn uniform_layout_bindings() -> [vk::DescriptorSetLayoutBinding; 1] {
    [vk::DescriptorSetLayoutBinding::builder()
        .binding(UNIFORM_BINDING)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::VERTEX)
        .build()]
}

/// Pool sizes for `set_count` uniform-buffer sets.
pub fn uniform_pool_sizes(set_count: u32) -> [vk::DescriptorPoolSize; 1] {
    [vk::DescriptorPoolSize {
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: set_count,
    }]
}

pub fn create_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let bindings = uniform_layout_bindings();
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }?;
    Ok(layout)
}

/// Descriptor pool plus one set per swapchain image.
pub struct DescriptorSets {
    pub pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
}

impl DescriptorSets {
    /// Allocate one set per uniform buffer and point it at that buffer.
    pub fn new(
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
        uniforms: &[BufferResource],
    ) -> Result<Self> {
        let set_count = uniforms.len().max(1) as u32;
        let pool_sizes = uniform_pool_sizes(set_count);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(set_count)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }?;

        let layouts = vec![layout; uniforms.len()];
        let sets = if layouts.is_empty() {
            Vec::new()
        } else {
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => sets,
                Err(e) => {
                    unsafe { device.destroy_descriptor_pool(pool, None) };
                    return Err(e.into());
                }
            }
        };

        for (set, uniform) in sets.iter().zip(uniforms) {
            write_uniform_buffer(device, *set, uniform.handle(), uniform.size());
        }

        Ok(Self { pool, sets })
    }

    /// Sets are freed with the pool.
    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
    }
}

/// Point `binding 0` of `set` at `buffer[0..range]`.
pub fn write_uniform_buffer(
    device: &ash::Device,
    set: vk::DescriptorSet,
    buffer: vk::Buffer,
    range: vk::DeviceSize,
) {
    let buffer_info = vk::DescriptorBufferInfo::builder()
        .buffer(buffer)
        .offset(0)
        .range(range)
        .build();

    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(UNIFORM_BINDING)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(std::slice::from_ref(&buffer_info))
        .build();

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

// Buffer resources for vertex, index, and uniform data
//
// Two ways to get bytes onto the GPU:
// - HostVisible: host-visible + coherent memory, mapped and copied directly
// - DeviceLocalStaged: copied through a transient staging buffer on the
//   transfer queue, blocking until the queue is idle

use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use super::command::CommandPool;
use super::device::DeviceQueue;
use super::VulkanDevice;
use crate::error::{GpuError, Result};

/// Lifecycle class of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    HostVisible,
    DeviceLocalStaged,
}

/// How initial contents reach the buffer.
#[derive(Clone, Copy)]
pub enum CopyStrategy<'a> {
    /// Map and memcpy.
    HostMapped,
    /// Stage and copy on `queue`; `pool` must belong to the queue's family.
    Staged {
        queue: &'a DeviceQueue,
        pool: &'a CommandPool,
    },
}

impl CopyStrategy<'_> {
    pub fn kind(&self) -> BufferKind {
        match self {
            CopyStrategy::HostMapped => BufferKind::HostVisible,
            CopyStrategy::Staged { .. } => BufferKind::DeviceLocalStaged,
        }
    }
}

fn host_visible() -> vk::MemoryPropertyFlags {
    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
}

/// Buffer usage actually requested from the driver. Staged buffers are
/// copy destinations, and copy sources so they can be read back.
pub fn effective_usage(kind: BufferKind, usage: vk::BufferUsageFlags) -> vk::BufferUsageFlags {
    match kind {
        BufferKind::HostVisible => usage,
        BufferKind::DeviceLocalStaged => {
            usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC
        }
    }
}

/// Create a buffer and bind fresh memory to it, cleaning up on failure.
fn create_raw(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
    families: &[u32],
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let mut buffer_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
    buffer_info = if families.len() > 1 {
        buffer_info
            .sharing_mode(vk::SharingMode::CONCURRENT)
            .queue_family_indices(families)
    } else {
        buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
    };

    let raw = &device.device;
    let buffer = unsafe { raw.create_buffer(&buffer_info, None) }?;

    let allocated = (|| {
        let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
        let memory_type_index =
            device.find_memory_type(requirements.memory_type_bits, memory_flags)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { raw.allocate_memory(&alloc_info, None) }?;

        if let Err(e) = unsafe { raw.bind_buffer_memory(buffer, memory, 0) } {
            unsafe { raw.free_memory(memory, None) };
            return Err(GpuError::from(e));
        }
        Ok(memory)
    })();

    match allocated {
        Ok(memory) => Ok((buffer, memory)),
        Err(e) => {
            unsafe { raw.destroy_buffer(buffer, None) };
            Err(e)
        }
    }
}

/// Copy `bytes` into host-visible memory at `offset`.
fn upload(
    device: &ash::Device,
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    bytes: &[u8],
) -> Result<()> {
    unsafe {
        let ptr = device.map_memory(
            memory,
            offset,
            bytes.len() as vk::DeviceSize,
            vk::MemoryMapFlags::empty(),
        )? as *mut u8;
        ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        device.unmap_memory(memory);
    }
    Ok(())
}

fn download(device: &ash::Device, memory: vk::DeviceMemory, size: vk::DeviceSize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; size as usize];
    unsafe {
        let ptr = device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty())? as *const u8;
        ptr.copy_to_nonoverlapping(bytes.as_mut_ptr(), bytes.len());
        device.unmap_memory(memory);
    }
    Ok(bytes)
}

/// A staging buffer that only lives for one transfer.
struct Staging<'a> {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    device: &'a ash::Device,
}

impl<'a> Staging<'a> {
    fn new(
        device: &'a VulkanDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let (buffer, memory) = create_raw(device, size, usage, host_visible(), &[])?;
        Ok(Self {
            buffer,
            memory,
            device: &device.device,
        })
    }
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

fn check_pool(queue: &DeviceQueue, pool: &CommandPool) -> Result<()> {
    if queue.family != pool.queue_family() {
        return Err(GpuError::InvalidState(format!(
            "command pool family {} does not match queue family {}",
            pool.queue_family(),
            queue.family
        )));
    }
    Ok(())
}

fn copy_buffer(
    pool: &CommandPool,
    queue: &DeviceQueue,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };
    pool.submit_one_shot(queue.handle, |device, cmd| unsafe {
        device.cmd_copy_buffer(cmd, src, dst, &[region]);
    })
}

/// A GPU buffer with its memory.
pub struct BufferResource {
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    element_count: u32,
    kind: BufferKind,
    usage: vk::BufferUsageFlags,
    closed: bool,
    device: Arc<VulkanDevice>,
}

impl BufferResource {
    /// Create a buffer initialised with `bytes`.
    pub fn new(
        device: &Arc<VulkanDevice>,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
        element_count: u32,
        strategy: CopyStrategy<'_>,
    ) -> Result<Self> {
        if bytes.is_empty() {
            return Err(GpuError::InvalidState("buffers cannot be empty".into()));
        }
        let size = bytes.len() as vk::DeviceSize;
        let kind = strategy.kind();
        let usage = effective_usage(kind, usage);

        let (handle, memory) = match strategy {
            CopyStrategy::HostMapped => {
                let (handle, memory) = create_raw(device, size, usage, host_visible(), &[])?;
                if let Err(e) = upload(&device.device, memory, 0, bytes) {
                    unsafe {
                        device.device.destroy_buffer(handle, None);
                        device.device.free_memory(memory, None);
                    }
                    return Err(e);
                }
                (handle, memory)
            }
            CopyStrategy::Staged { queue, pool } => {
                check_pool(queue, pool)?;

                let staging = Staging::new(device, size, vk::BufferUsageFlags::TRANSFER_SRC)?;
                upload(&device.device, staging.memory, 0, bytes)?;

                // Written on the transfer queue, read on the graphics queue
                let mut families = vec![queue.family, device.graphics_queue().family];
                families.dedup();
                let (handle, memory) = create_raw(
                    device,
                    size,
                    usage,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    &families,
                )?;

                if let Err(e) = copy_buffer(pool, queue, staging.buffer, handle, size) {
                    unsafe {
                        device.device.destroy_buffer(handle, None);
                        device.device.free_memory(memory, None);
                    }
                    return Err(e);
                }
                // Staging is released here, right after the copy completed
                (handle, memory)
            }
        };

        log::debug!(
            "Created {:?} buffer: {} bytes, usage {:?}",
            kind,
            size,
            usage
        );

        Ok(Self {
            handle,
            memory,
            size,
            element_count,
            kind,
            usage,
            closed: false,
            device: device.clone(),
        })
    }

    /// Create a buffer holding `data`, one element per item.
    pub fn from_slice<T: Pod>(
        device: &Arc<VulkanDevice>,
        usage: vk::BufferUsageFlags,
        data: &[T],
        strategy: CopyStrategy<'_>,
    ) -> Result<Self> {
        Self::new(
            device,
            usage,
            bytemuck::cast_slice(data),
            data.len() as u32,
            strategy,
        )
    }

    /// Zero-filled host-visible buffer of `size` bytes.
    pub fn host_visible(
        device: &Arc<VulkanDevice>,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let zeros = vec![0u8; size as usize];
        Self::new(device, usage, &zeros, 1, CopyStrategy::HostMapped)
    }

    /// Overwrite bytes starting at `offset`. Host-visible buffers only;
    /// the caller guarantees no pending GPU work reads this range.
    pub fn write(&self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.kind != BufferKind::HostVisible {
            return Err(GpuError::InvalidState(
                "device-local buffers cannot be written from the host".into(),
            ));
        }
        if offset + bytes.len() as vk::DeviceSize > self.size {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at {} overflows {}-byte buffer",
                bytes.len(),
                offset,
                self.size
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        upload(&self.device.device, self.memory, offset, bytes)
    }

    pub fn write_pod<T: Pod>(&self, value: &T) -> Result<()> {
        self.write(0, bytemuck::bytes_of(value))
    }

    /// Copy the buffer's contents back to the host. Device-local buffers
    /// go through a host-visible buffer copied on `queue`.
    pub fn read_back(&self, queue: &DeviceQueue, pool: &CommandPool) -> Result<Vec<u8>> {
        self.ensure_open()?;
        match self.kind {
            BufferKind::HostVisible => download(&self.device.device, self.memory, self.size),
            BufferKind::DeviceLocalStaged => {
                check_pool(queue, pool)?;
                let readback =
                    Staging::new(&self.device, self.size, vk::BufferUsageFlags::TRANSFER_DST)?;
                copy_buffer(pool, queue, self.handle, readback.buffer, self.size)?;
                download(&self.device.device, readback.memory, self.size)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(GpuError::InvalidState("buffer already closed".into()))
        } else {
            Ok(())
        }
    }

    /// Destroy the buffer, then its memory. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        unsafe {
            self.device.device.destroy_buffer(self.handle, None);
            self.device.device.free_memory(self.memory, None);
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for BufferResource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_visible_keeps_caller_usage() {
        let usage = effective_usage(BufferKind::HostVisible, vk::BufferUsageFlags::UNIFORM_BUFFER);
        assert_eq!(usage, vk::BufferUsageFlags::UNIFORM_BUFFER);
    }

    #[test]
    fn staged_buffers_are_copy_targets() {
        let usage = effective_usage(
            BufferKind::DeviceLocalStaged,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        );
        assert!(usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(usage.contains(vk::BufferUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn strategy_maps_to_kind() {
        assert_eq!(CopyStrategy::HostMapped.kind(), BufferKind::HostVisible);
    }
}

// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// One FrameSync per frame in flight, indexed round-robin by the pacer

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::Result;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub copy_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            copy_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
        };

        // Destroy whatever was created if a later call fails
        let created: Result<()> = unsafe {
            (|| {
                sync.image_available = device.create_semaphore(&semaphore_info, None)?;
                sync.render_finished = device.create_semaphore(&semaphore_info, None)?;
                sync.copy_finished = device.create_semaphore(&semaphore_info, None)?;
                sync.in_flight_fence = device.create_fence(&fence_info, None)?;
                Ok(())
            })()
        };

        match created {
            Ok(()) => Ok(sync),
            Err(e) => {
                sync.destroy(device);
                Err(e)
            }
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            // Null handles are ignored by vkDestroy*
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_semaphore(self.copy_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Arena of per-slot sync objects.
pub struct FrameSyncSet {
    frames: Vec<FrameSync>,
    device: Arc<VulkanDevice>,
}

impl FrameSyncSet {
    pub fn new(device: &Arc<VulkanDevice>, frames_in_flight: usize) -> Result<Self> {
        let mut set = Self {
            frames: Vec::with_capacity(frames_in_flight),
            device: device.clone(),
        };
        for _ in 0..frames_in_flight {
            // Drop of `set` cleans up earlier slots on failure
            set.frames.push(FrameSync::new(&device.device)?);
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, slot: usize) -> &FrameSync {
        &self.frames[slot % self.frames.len()]
    }

    /// Block until the slot's last submission has completed.
    pub fn wait(&self, slot: usize) -> Result<()> {
        let fence = self.get(slot).in_flight_fence;
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }?;
        Ok(())
    }

    /// Unsignal the slot's fence; only right before submitting with it.
    pub fn reset(&self, slot: usize) -> Result<()> {
        let fence = self.get(slot).in_flight_fence;
        unsafe { self.device.device.reset_fences(&[fence]) }?;
        Ok(())
    }
}

impl Drop for FrameSyncSet {
    fn drop(&mut self) {
        for frame in &self.frames {
            frame.destroy(&self.device.device);
        }
    }
}

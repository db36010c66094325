// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync

use ash::vk;
use std::sync::Arc;

use super::device::VulkanDevice;
use super::error::{GfxResult, VkCheck};

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: Arc<VulkanDevice>) -> GfxResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // Start signaled so the first wait returns

        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            device,
        };

        unsafe {
            let device = &sync.device.device;
            sync.image_available = device
                .create_semaphore(&semaphore_info, None)
                .check("vkCreateSemaphore")?;
            sync.render_finished = device
                .create_semaphore(&semaphore_info, None)
                .check("vkCreateSemaphore")?;
            sync.in_flight_fence = device
                .create_fence(&fence_info, None)
                .check("vkCreateFence")?;
        }

        Ok(sync)
    }

    /// Block until the GPU work last submitted with this fence has retired
    pub fn wait(&self) -> GfxResult<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .check("vkWaitForFences")
    }

    pub fn reset(&self) -> GfxResult<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence]) }
            .check("vkResetFences")
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            // null handles are ignored by the destroy calls
            let device = &self.device.device;
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

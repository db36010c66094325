// Host -> device transfers through staging buffers
//
// Every transfer records into a one-time command buffer, submits it to the
// graphics queue and blocks until the queue is idle. The staging buffer is
// dropped as soon as that returns.

use ash::vk;
use std::sync::Arc;

use super::buffer::{allocate_image_memory, transfer_size, GpuBuffer};
use super::device::VulkanDevice;
use super::error::{GfxError, GfxResult, VkCheck};

/// Access masks and pipeline stages guarding one image layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Transition between two layouts, guarded by its access/stage masks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old: vk::ImageLayout,
    pub new: vk::ImageLayout,
    pub masks: TransitionMasks,
}

impl LayoutTransition {
    pub fn new(old: vk::ImageLayout, new: vk::ImageLayout) -> GfxResult<Self> {
        let masks = transition_masks(old, new)
            .ok_or(GfxError::UnsupportedLayoutTransition { old, new })?;
        Ok(Self { old, new, masks })
    }
}

/// The two transitions a sampled texture goes through; anything else is unsupported
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Option<TransitionMasks> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Some(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Some(TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => None,
    }
}

/// A primary command buffer that is freed back to its pool on drop
struct OneTimeCommands<'a> {
    device: &'a VulkanDevice,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

impl Drop for OneTimeCommands<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .free_command_buffers(self.pool, &[self.cmd]);
        }
    }
}

pub struct Uploader {
    device: Arc<VulkanDevice>,
    command_pool: vk::CommandPool,
}

impl Uploader {
    pub fn new(device: Arc<VulkanDevice>) -> GfxResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            // TRANSIENT: every buffer from this pool lives for one submit
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .check("vkCreateCommandPool")?;

        Ok(Self {
            device,
            command_pool,
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    /// Record with `record`, submit to the graphics queue and wait for idle
    pub fn submit_one_time<F>(&self, record: F) -> GfxResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .check("vkAllocateCommandBuffers")?[0];
        let commands = OneTimeCommands {
            device: &self.device,
            pool: self.command_pool,
            cmd,
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device
                .begin_command_buffer(commands.cmd, &begin_info)
                .check("vkBeginCommandBuffer")?;
            record(device, commands.cmd);
            device
                .end_command_buffer(commands.cmd)
                .check("vkEndCommandBuffer")?;

            let command_buffers = [commands.cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    vk::Fence::null(),
                )
                .check("vkQueueSubmit")?;
            device
                .queue_wait_idle(self.device.graphics_queue)
                .check("vkQueueWaitIdle")?;
        }

        Ok(())
    }

    /// Copy `data` into a new device-local buffer with `usage` (+ TRANSFER_DST)
    pub fn upload_buffer(&self, data: &[u8], usage: vk::BufferUsageFlags) -> GfxResult<GpuBuffer> {
        transfer_size(data.len(), "buffer upload")?;
        let staging = GpuBuffer::staging_with_data(self.device.clone(), data)?;

        let destination = GpuBuffer::new(
            self.device.clone(),
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        self.copy_buffer(&staging, &destination, staging.size)?;
        drop(staging);

        log::debug!("Uploaded {} bytes ({:?})", data.len(), usage);
        Ok(destination)
    }

    /// Read the first `len` bytes of a device-local buffer back to the host.
    ///
    /// The source needs TRANSFER_SRC usage.
    #[allow(dead_code)] // only read back by the round-trip tests
    pub fn download_buffer(&self, source: &GpuBuffer, len: usize) -> GfxResult<Vec<u8>> {
        debug_assert!(source.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        let size = transfer_size(len, "buffer download")?;
        if size > source.size {
            return Err(GfxError::BufferOverflow {
                requested: size,
                size: source.size,
            });
        }
        let staging = GpuBuffer::new(
            self.device.clone(),
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        self.copy_buffer(source, &staging, size)?;
        staging.read_once(len)
    }

    fn copy_buffer(&self, src: &GpuBuffer, dst: &GpuBuffer, size: vk::DeviceSize) -> GfxResult<()> {
        self.submit_one_time(|device, cmd| unsafe {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]);
        })
    }

    /// Upload tightly packed pixels into a new device-local, sampled 2D image.
    ///
    /// The image ends in SHADER_READ_ONLY_OPTIMAL.
    pub fn upload_image(
        &self,
        pixels: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> GfxResult<(vk::Image, vk::DeviceMemory)> {
        transfer_size(pixels.len(), "image upload")?;
        let device = &self.device.device;
        let to_transfer_dst = LayoutTransition::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        let to_shader_read = LayoutTransition::new(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        let staging = GpuBuffer::staging_with_data(self.device.clone(), pixels)?;

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.create_image(&image_info, None) }.check("vkCreateImage")?;

        let memory = match allocate_image_memory(&self.device, image, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let copy = self.submit_one_time(|device, cmd| unsafe {
            record_transition(device, cmd, image, &to_transfer_dst);

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .build();

            device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            record_transition(device, cmd, image, &to_shader_read);
        });

        drop(staging);

        if let Err(e) = copy {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(e);
        }

        log::debug!(
            "Uploaded {}x{} image ({} bytes, {:?})",
            extent.width,
            extent.height,
            pixels.len(),
            format
        );
        Ok((image, memory))
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Record a pipeline barrier moving `image` through `transition`
unsafe fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    transition: &LayoutTransition,
) {
    let masks = &transition.masks;
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(transition.old)
        .new_layout(transition.new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    device.cmd_pipeline_barrier(
        cmd,
        masks.src_stage,
        masks.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::{DeviceRequirements, SelectionPolicy};
    use crate::backend::instance::Instance;

    /// Any usable device, no window. `None` when the machine has no Vulkan.
    fn headless_uploader() -> Option<Uploader> {
        let instance = match Instance::new("upload-test", None, false) {
            Ok(instance) => instance,
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                return None;
            }
        };
        let requirements = DeviceRequirements {
            require_discrete_gpu: false,
            require_geometry_shader: false,
        };
        let device = match VulkanDevice::new(instance, None, &requirements, SelectionPolicy::FirstMatch) {
            Ok(device) => device,
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                return None;
            }
        };
        Some(Uploader::new(device).expect("command pool"))
    }

    #[test]
    fn transitions_bracket_the_copy() {
        let before = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(before.src_access, vk::AccessFlags::empty());
        assert_eq!(before.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(before.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let after = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        // the second barrier waits on exactly what the first one unblocked
        assert_eq!(after.src_access, before.dst_access);
        assert_eq!(after.src_stage, before.dst_stage);
        assert_eq!(after.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(after.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn unknown_transitions_are_rejected() {
        let err = LayoutTransition::new(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap_err();
        assert!(matches!(err, GfxError::UnsupportedLayoutTransition { .. }));

        assert!(transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        )
        .is_none());
        assert!(transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        )
        .is_none());
    }

    #[test]
    fn buffer_round_trip_is_byte_identical() {
        let Some(uploader) = headless_uploader() else {
            return;
        };

        // xorshift so the payload has no repeating structure
        let mut state = 0x2545_f491_u32;
        let payload: Vec<u8> = (0..4099)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();

        let buffer = uploader
            .upload_buffer(
                &payload,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
            )
            .unwrap();

        let downloaded = uploader.download_buffer(&buffer, payload.len()).unwrap();
        assert_eq!(downloaded, payload);
    }

    #[test]
    fn image_upload_completes() {
        let Some(uploader) = headless_uploader() else {
            return;
        };

        let extent = vk::Extent2D { width: 4, height: 4 };
        let pixels = vec![0x7fu8; 4 * 4 * 4];
        let (image, memory) = uploader
            .upload_image(&pixels, extent, vk::Format::R8G8B8A8_UNORM)
            .unwrap();

        unsafe {
            let device = &uploader.device().device;
            device.destroy_image(image, None);
            device.free_memory(memory, None);
        }
    }

    #[test]
    fn empty_payloads_are_refused_before_allocation() {
        let Some(uploader) = headless_uploader() else {
            return;
        };

        let err = uploader
            .upload_buffer(&[], vk::BufferUsageFlags::VERTEX_BUFFER)
            .err()
            .unwrap();
        assert!(matches!(err, GfxError::EmptyTransfer(_)));

        let extent = vk::Extent2D { width: 0, height: 0 };
        let err = uploader
            .upload_image(&[], extent, vk::Format::R8G8B8A8_UNORM)
            .unwrap_err();
        assert!(matches!(err, GfxError::EmptyTransfer(_)));

        let buffer = uploader
            .upload_buffer(&[1, 2, 3, 4], vk::BufferUsageFlags::TRANSFER_SRC)
            .unwrap();
        assert!(matches!(
            uploader.download_buffer(&buffer, 0),
            Err(GfxError::EmptyTransfer(_))
        ));
        assert!(matches!(
            uploader.download_buffer(&buffer, 5),
            Err(GfxError::BufferOverflow { requested: 5, size: 4 })
        ));
    }
}

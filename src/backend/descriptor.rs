// Descriptor sets: one per frame slot, each pointing at that slot's uniform
// buffer (binding 0) and the shared texture sampler (binding 1).

use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::device::VulkanDevice;
use super::error::{GfxResult, VkCheck};
use super::texture::Texture;

pub const UNIFORM_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;

pub struct DescriptorBinder {
    pub layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    /// Indexed by frame slot
    pub sets: Vec<vk::DescriptorSet>,
    device: Arc<VulkanDevice>,
}

/// Pool sizes for `set_count` sets of one uniform buffer + one sampler each
pub fn pool_sizes(set_count: u32) -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: set_count,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: set_count,
        },
    ]
}

pub fn layout_bindings() -> [vk::DescriptorSetLayoutBinding; 2] {
    [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(SAMPLER_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ]
}

impl DescriptorBinder {
    /// Create the layout and a pool with room for exactly `set_count` sets
    pub fn new(device: Arc<VulkanDevice>, set_count: u32) -> GfxResult<Self> {
        let bindings = layout_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .check("vkCreateDescriptorSetLayout")?;

        let sizes = pool_sizes(set_count);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(set_count);
        let pool = match unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .check("vkCreateDescriptorPool")
        {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(layout, None) };
                return Err(e);
            }
        };

        Ok(Self {
            layout,
            pool,
            sets: Vec::new(),
            device,
        })
    }

    /// Allocate one set per uniform buffer and wire each to its buffer and
    /// the shared texture. Done once; sets are never rebound.
    pub fn allocate_and_write(
        &mut self,
        uniform_buffers: &[GpuBuffer],
        texture: &Texture,
    ) -> GfxResult<()> {
        let layouts = vec![self.layout; uniform_buffers.len()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .check("vkAllocateDescriptorSets")?;

        for (&set, uniform) in sets.iter().zip(uniform_buffers) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: uniform.buffer,
                offset: 0,
                range: uniform.size,
            }];
            let image_info = [vk::DescriptorImageInfo {
                sampler: texture.sampler,
                image_view: texture.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];

            let writes = [
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(UNIFORM_BINDING)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(SAMPLER_BINDING)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info)
                    .build(),
            ];

            unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
        }

        log::debug!("Wrote {} descriptor sets", sets.len());
        self.sets = sets;
        Ok(())
    }
}

impl Drop for DescriptorBinder {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees its sets
            self.device.device.destroy_descriptor_pool(self.pool, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_holds_one_of_each_descriptor_per_set() {
        let sizes = pool_sizes(2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 2);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 2);
    }

    #[test]
    fn bindings_match_shader_interface() {
        let [uniform, sampler] = layout_bindings();
        assert_eq!(uniform.binding, UNIFORM_BINDING);
        assert_eq!(uniform.stage_flags, vk::ShaderStageFlags::VERTEX);
        assert_eq!(sampler.binding, SAMPLER_BINDING);
        assert_eq!(sampler.stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }
}

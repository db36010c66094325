// GPU buffers for vertex, index, uniform and staging data
//
// Every buffer owns its memory and releases both on drop.

use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

use super::device::VulkanDevice;
use super::error::{GfxError, GfxResult, VkCheck};

/// Lowest memory type index allowed by `type_filter` whose flags include `required`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> GfxResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let has_type = (type_filter & (1 << i)) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required);
            has_type && has_properties
        })
        .ok_or(GfxError::NoSuitableMemoryType {
            type_filter,
            required,
        })
}

/// Byte count of a host/device transfer. Vulkan buffers cannot be empty, so
/// zero is rejected before anything is allocated.
pub fn transfer_size(len: usize, what: &'static str) -> GfxResult<vk::DeviceSize> {
    if len == 0 {
        return Err(GfxError::EmptyTransfer(what));
    }
    Ok(len as vk::DeviceSize)
}

fn check_fits(len: usize, size: vk::DeviceSize) -> GfxResult<()> {
    let requested = len as vk::DeviceSize;
    if requested > size {
        return Err(GfxError::BufferOverflow { requested, size });
    }
    Ok(())
}

fn mapped_destination(
    mapped: Option<NonNull<u8>>,
    len: usize,
    size: vk::DeviceSize,
) -> GfxResult<NonNull<u8>> {
    let ptr = mapped.ok_or(GfxError::NotMapped)?;
    check_fits(len, size)?;
    Ok(ptr)
}

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Set for persistently mapped (host-visible) buffers
    mapped: Option<NonNull<u8>>,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> GfxResult<Self> {
        if size == 0 {
            return Err(GfxError::EmptyTransfer("buffer"));
        }
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .check("vkCreateBuffer")?;

        let memory = match allocate_buffer_memory(&device, buffer, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        Ok(Self {
            buffer,
            memory,
            size,
            usage,
            mapped: None,
            device,
        })
    }

    /// Host-visible + coherent buffer used only to shuttle `data` to the GPU
    pub fn staging_with_data(device: Arc<VulkanDevice>, data: &[u8]) -> GfxResult<Self> {
        let staging = Self::new(
            device,
            transfer_size(data.len(), "staging write")?,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write_once(data)?;
        Ok(staging)
    }

    /// Host-visible + coherent buffer that stays mapped for its whole life
    pub fn persistently_mapped(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> GfxResult<Self> {
        let mut buffer = Self::new(
            device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let ptr = unsafe {
            buffer
                .device
                .device
                .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
        }
        .check("vkMapMemory")?;
        buffer.mapped = Some(NonNull::new(ptr.cast::<u8>()).ok_or(GfxError::NotMapped)?);

        Ok(buffer)
    }

    /// Map, copy `data` in, unmap
    pub fn write_once(&self, data: &[u8]) -> GfxResult<()> {
        check_fits(data.len(), self.size)?;
        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .check("vkMapMemory")?
                .cast::<u8>();
            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Map, copy `len` bytes out, unmap
    pub fn read_once(&self, len: usize) -> GfxResult<Vec<u8>> {
        check_fits(len, self.size)?;
        let mut out = vec![0u8; len];
        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .check("vkMapMemory")?
                .cast::<u8>();
            out.as_mut_ptr().copy_from_nonoverlapping(ptr, len);
            self.device.device.unmap_memory(self.memory);
        }
        Ok(out)
    }

    /// Overwrite the start of a persistently mapped buffer
    pub fn write_mapped(&mut self, data: &[u8]) -> GfxResult<()> {
        let ptr = mapped_destination(self.mapped, data.len(), self.size)?;
        // HOST_COHERENT: no flush needed
        unsafe { ptr.as_ptr().copy_from_nonoverlapping(data.as_ptr(), data.len()) };
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.device.unmap_memory(self.memory);
            }
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

fn allocate_buffer_memory(
    device: &VulkanDevice,
    buffer: vk::Buffer,
    memory_properties: vk::MemoryPropertyFlags,
) -> GfxResult<vk::DeviceMemory> {
    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
    let memory_type_index = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        memory_properties,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
        .check("vkAllocateMemory")?;

    if let Err(e) = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) }
        .check("vkBindBufferMemory")
    {
        unsafe { device.device.free_memory(memory, None) };
        return Err(e);
    }

    Ok(memory)
}

/// Allocate and bind memory for an image
pub fn allocate_image_memory(
    device: &VulkanDevice,
    image: vk::Image,
    memory_properties: vk::MemoryPropertyFlags,
) -> GfxResult<vk::DeviceMemory> {
    let requirements = unsafe { device.device.get_image_memory_requirements(image) };
    let memory_type_index = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        memory_properties,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
        .check("vkAllocateMemory")?;

    if let Err(e) = unsafe { device.device.bind_image_memory(image, memory, 0) }
        .check("vkBindImageMemory")
    {
        unsafe { device.device.free_memory(memory, None) };
        return Err(e);
    }

    Ok(memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    #[test]
    fn picks_first_type_matching_filter_and_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let index = find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn superset_of_required_flags_qualifies() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let required = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, required).unwrap(), 1);
    }

    #[test]
    fn filter_bits_exclude_types() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            1
        );
    }

    #[test]
    fn no_qualifying_type_is_an_error() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let err = find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap_err();
        assert!(matches!(
            err,
            GfxError::NoSuitableMemoryType { type_filter: 0b01, .. }
        ));
    }

    #[test]
    fn types_beyond_reported_count_are_ignored() {
        let mut props = memory_properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert!(find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::DEVICE_LOCAL).is_err());
    }

    #[test]
    fn empty_transfers_are_rejected() {
        assert!(matches!(
            transfer_size(0, "upload"),
            Err(GfxError::EmptyTransfer("upload"))
        ));
        assert_eq!(transfer_size(28, "upload").unwrap(), 28);
    }

    #[test]
    fn accesses_past_the_end_are_errors() {
        assert!(check_fits(64, 64).is_ok());
        assert!(matches!(
            check_fits(65, 64),
            Err(GfxError::BufferOverflow {
                requested: 65,
                size: 64
            })
        ));
    }

    #[test]
    fn mapped_writes_need_a_mapping_and_room() {
        assert!(matches!(
            mapped_destination(None, 4, 64),
            Err(GfxError::NotMapped)
        ));

        let ptr = NonNull::<u8>::dangling();
        assert!(matches!(
            mapped_destination(Some(ptr), 192, 64),
            Err(GfxError::BufferOverflow { .. })
        ));
        assert_eq!(mapped_destination(Some(ptr), 64, 64).unwrap(), ptr);
    }
}

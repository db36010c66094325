// Sampled 2D texture: image + memory + view + sampler

use ash::vk;
use std::path::Path;
use std::sync::Arc;

use super::device::VulkanDevice;
use super::error::{GfxError, GfxResult, VkCheck};
use super::swapchain::create_color_view;
use super::upload::Uploader;

pub struct Texture {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

/// Decoded RGBA8 pixels, tightly packed
pub struct PixelData {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PixelData {
    pub fn load(path: &Path) -> GfxResult<Self> {
        let decoded = image::open(path).map_err(|e| GfxError::Asset {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();

        Ok(Self {
            pixels: rgba.into_raw(),
            width,
            height,
        })
    }
}

impl Texture {
    /// Decode an image file and upload it as an sRGB texture
    pub fn from_file(uploader: &Uploader, path: &Path) -> GfxResult<Self> {
        let data = PixelData::load(path)?;
        log::info!("Loaded texture {:?} ({}x{})", path, data.width, data.height);
        Self::from_pixels(uploader, &data)
    }

    pub fn from_pixels(uploader: &Uploader, data: &PixelData) -> GfxResult<Self> {
        let device = uploader.device().clone();
        let extent = vk::Extent2D {
            width: data.width,
            height: data.height,
        };
        let format = vk::Format::R8G8B8A8_SRGB;

        let (image, memory) = uploader.upload_image(&data.pixels, extent, format)?;

        // From here on, Drop handles whatever has been created
        let mut texture = Self {
            image,
            memory,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            extent,
            device,
        };

        texture.view = create_color_view(&texture.device, image, format)?;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(0.0);

        texture.sampler = unsafe { texture.device.device.create_sampler(&sampler_info, None) }
            .check("vkCreateSampler")?;

        Ok(texture)
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            let device = &self.device.device;
            if self.sampler != vk::Sampler::null() {
                device.destroy_sampler(self.sampler, None);
            }
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
            }
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_texture_decodes_to_rgba8() {
        let data = PixelData::load(Path::new("textures/texture.png")).unwrap();
        assert!(data.width > 0 && data.height > 0);
        assert_eq!(data.pixels.len(), (data.width * data.height * 4) as usize);
    }

    #[test]
    fn missing_texture_is_an_asset_error() {
        let err = PixelData::load(Path::new("textures/nope.png")).err().unwrap();
        assert!(matches!(err, GfxError::Asset { .. }));
    }
}

// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Shaders are compiled by build.rs and read
// from disk at startup; a missing or malformed file is fatal.

use ash::vk;
use std::path::Path;

use super::device::VulkanDevice;
use super::error::{GfxError, GfxResult, VkCheck};

/// Read a SPIR-V binary into aligned 32-bit words
pub fn read_spirv(path: &Path) -> GfxResult<Vec<u32>> {
    let asset_error = |source| GfxError::Asset {
        path: path.to_path_buf(),
        source,
    };
    let bytes = std::fs::read(path).map_err(asset_error)?;
    // read_spv checks the length and magic number and fixes endianness
    ash::util::read_spv(&mut std::io::Cursor::new(bytes)).map_err(asset_error)
}

pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> GfxResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .check("vkCreateShaderModule")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("quad-renderer-{}-{}", std::process::id(), name));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn reads_words_from_valid_spirv() {
        let words: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let path = temp_file("valid.spv", &bytes);

        let code = read_spirv(&path).unwrap();
        assert_eq!(code, words);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_truncated_binary() {
        let path = temp_file("truncated.spv", &[0x03, 0x02, 0x23, 0x07, 0x00]);
        assert!(matches!(read_spirv(&path), Err(GfxError::Asset { .. })));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_is_an_asset_error() {
        let err = read_spirv(Path::new("shaders/does-not-exist.spv")).unwrap_err();
        assert!(matches!(err, GfxError::Asset { .. }));
    }
}

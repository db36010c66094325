// Graphics error type and the result-checking helper
//
// Every raw Vulkan call goes through `VkCheck::check`, which tags the
// failure with the call name. Callers then decide to propagate or abort.

use ash::prelude::VkResult;
use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GfxError {
    #[error("{call} failed: {result:?}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("Failed to load the Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("No Vulkan-capable devices found")]
    NoDevices,

    #[error("No eligible GPU found among {candidates} device(s)")]
    NoEligibleDevice { candidates: usize },

    #[error("No memory type matches filter {type_filter:#b} with properties {required:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("Surface reports no formats")]
    NoSurfaceFormat,

    #[error("Surface format changed from {old:?} to {new:?} across a swapchain rebuild")]
    SurfaceFormatChanged { old: vk::Format, new: vk::Format },

    #[error("No barrier masks known for layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("Zero-length {0} rejected")]
    EmptyTransfer(&'static str),

    #[error("{requested} byte access overruns a {size} byte buffer")]
    BufferOverflow {
        requested: vk::DeviceSize,
        size: vk::DeviceSize,
    },

    #[error("Buffer is not persistently mapped")]
    NotMapped,

    #[error("Unsupported window system: {0}")]
    UnsupportedPlatform(String),

    #[error("Failed to read asset {path:?}: {source}")]
    Asset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type GfxResult<T> = Result<T, GfxError>;

/// Converts a raw API result into a tagged `GfxResult`
pub trait VkCheck<T> {
    fn check(self, call: &'static str) -> GfxResult<T>;
}

impl<T> VkCheck<T> for VkResult<T> {
    #[inline]
    fn check(self, call: &'static str) -> GfxResult<T> {
        self.map_err(|result| GfxError::Vulkan { call, result })
    }
}

/// Log a failure that has nowhere to propagate to, such as inside `Drop`.
/// Returns whether `result` was Ok.
pub fn log_failure(context: &str, result: GfxResult<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::error!("{}: {}", context, e);
            false
        }
    }
}

// Backend module - Vulkan abstraction layer
//
// Design: Thin RAII wrappers around ash. Every handle is owned by exactly one
// struct and destroyed in its Drop; device-derived structs hold an
// Arc<VulkanDevice> so the device always outlives them.

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod upload;

pub use buffer::GpuBuffer;
pub use device::VulkanDevice;
pub use instance::Instance;
pub use surface::Surface;
pub use swapchain::Swapchain;

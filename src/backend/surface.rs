// Window surface - the connection between Vulkan and the window system
//
// Creation is platform-specific; everything after creation (support queries)
// goes through the generic VK_KHR_surface loader.

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::error::{GfxError, GfxResult, VkCheck};
use super::instance::Instance;

pub struct Surface {
    pub surface: vk::SurfaceKHR,
    pub loader: khr::Surface,
    _instance: Arc<Instance>,
}

/// Everything the surface reports for one physical device
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// A device can drive this surface only if it offers at least one of each
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

impl Surface {
    pub fn new<W>(instance: Arc<Instance>, window: &W) -> GfxResult<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let window_handle = window
            .window_handle()
            .map_err(|e| GfxError::UnsupportedPlatform(e.to_string()))?
            .as_raw();
        let display_handle = window
            .display_handle()
            .map_err(|e| GfxError::UnsupportedPlatform(e.to_string()))?
            .as_raw();

        let surface = unsafe { create_platform_surface(&instance, display_handle, window_handle) }?;
        let loader = instance.surface_loader();

        Ok(Self {
            surface,
            loader,
            _instance: instance,
        })
    }

    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> GfxResult<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.surface)
        }
        .check("vkGetPhysicalDeviceSurfaceSupportKHR")
    }

    pub fn query_support(&self, physical_device: vk::PhysicalDevice) -> GfxResult<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .check("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .check("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .check("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}

unsafe fn create_platform_surface(
    instance: &Instance,
    display_handle: RawDisplayHandle,
    window_handle: RawWindowHandle,
) -> GfxResult<vk::SurfaceKHR> {
    match (display_handle, window_handle) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(&instance.entry, &instance.instance)
                .create_win32_surface(&create_info, None)
                .check("vkCreateWin32SurfaceKHR")
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut _)
                .window(window.window);
            khr::XlibSurface::new(&instance.entry, &instance.instance)
                .create_xlib_surface(&create_info, None)
                .check("vkCreateXlibSurfaceKHR")
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .map(|c| c.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection)
                .window(window.window.get());
            khr::XcbSurface::new(&instance.entry, &instance.instance)
                .create_xcb_surface(&create_info, None)
                .check("vkCreateXcbSurfaceKHR")
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            khr::WaylandSurface::new(&instance.entry, &instance.instance)
                .create_wayland_surface(&create_info, None)
                .check("vkCreateWaylandSurfaceKHR")
        }
        (display, window) => Err(GfxError::UnsupportedPlatform(format!(
            "{:?} / {:?}",
            display, window
        ))),
    }
}

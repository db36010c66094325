// Vulkan Instance - loader entry point
//
// Responsibilities:
// - Load the Vulkan library
// - Instance creation with window-system surface extensions
// - Validation layers + debug messenger (when every requested layer exists)

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::error::{GfxError, GfxResult, VkCheck};

const VALIDATION_LAYERS: &[&CStr] = &[c"VK_LAYER_KHRONOS_validation"];

pub struct Instance {
    pub entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    /// Create an instance able to present to windows of `display`'s kind.
    ///
    /// Pass `None` for a headless instance (no surface extensions).
    pub fn new(
        app_name: &str,
        display: Option<RawDisplayHandle>,
        enable_validation: bool,
    ) -> GfxResult<Arc<Self>> {
        let entry = unsafe { Entry::load() }?;

        let app_name_cstr = CString::new(app_name).unwrap_or_default();
        let engine_name = c"quad-renderer";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions = match display {
            Some(display) => surface_extensions(display)?,
            None => Vec::new(),
        };

        let enabled_layers = if enable_validation {
            let available = entry
                .enumerate_instance_layer_properties()
                .check("vkEnumerateInstanceLayerProperties")?;
            let available: Vec<&CStr> = available
                .iter()
                .map(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) })
                .collect();

            if layers_available(VALIDATION_LAYERS, &available) {
                VALIDATION_LAYERS.to_vec()
            } else {
                log::warn!("Validation layers requested but not installed, continuing without them");
                Vec::new()
            }
        } else {
            Vec::new()
        };

        let with_debug_utils = !enabled_layers.is_empty();
        if with_debug_utils {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names: Vec<*const c_char> = enabled_layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .check("vkCreateInstance")?;

        let debug_utils = if with_debug_utils {
            match setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::info!(
            "Created Vulkan instance ({} extension(s), validation {})",
            extensions.len(),
            if with_debug_utils { "on" } else { "off" }
        );

        Ok(Arc::new(Self {
            entry,
            instance,
            debug_utils,
        }))
    }

    pub fn surface_loader(&self) -> khr::Surface {
        khr::Surface::new(&self.entry, &self.instance)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// True when every requested layer name appears in `available`
pub fn layers_available(requested: &[&CStr], available: &[&CStr]) -> bool {
    requested
        .iter()
        .all(|wanted| available.iter().any(|have| have == wanted))
}

/// Instance extensions needed to create a surface for this display kind
fn surface_extensions(display: RawDisplayHandle) -> GfxResult<Vec<*const c_char>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => return Err(GfxError::UnsupportedPlatform(format!("{:?}", other))),
    };
    Ok(vec![khr::Surface::name().as_ptr(), platform.as_ptr()])
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> GfxResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .check("vkCreateDebugUtilsMessengerEXT")?;

    Ok((debug_utils, messenger))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

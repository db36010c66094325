// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device eligibility checks and selection
// - Logical device + graphics/present queue creation
// - Cached memory properties for memory-type selection

use ash::extensions::khr;
use ash::vk;
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

use super::error::{log_failure, GfxError, GfxResult, VkCheck};
use super::instance::Instance;
use super::surface::Surface;

/// Eligibility predicates that callers may relax
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRequirements {
    pub require_discrete_gpu: bool,
    pub require_geometry_shader: bool,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            require_discrete_gpu: true,
            require_geometry_shader: true,
        }
    }
}

/// Which eligible device wins when several qualify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Keep overwriting the pick: the last eligible device in enumeration order
    LastMatch,
    FirstMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Distinct families, one queue is created per entry
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present].into_iter().collect();
        set.into_iter().collect()
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Everything eligibility depends on, gathered from one physical device
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub geometry_shader: bool,
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
    pub extensions_supported: bool,
    /// Surface reports at least one format and one present mode
    pub surface_adequate: bool,
}

impl DeviceCandidate {
    pub fn queue_families(&self) -> Option<QueueFamilyIndices> {
        Some(QueueFamilyIndices {
            graphics: self.graphics_family?,
            present: self.present_family?,
        })
    }

    pub fn is_eligible(&self, requirements: &DeviceRequirements) -> bool {
        self.queue_families().is_some()
            && self.extensions_supported
            && self.surface_adequate
            && (!requirements.require_discrete_gpu
                || self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
            && (!requirements.require_geometry_shader || self.geometry_shader)
    }
}

/// Index of the selected candidate, or `None` if nothing qualifies
pub fn select_device(
    candidates: &[DeviceCandidate],
    requirements: &DeviceRequirements,
    policy: SelectionPolicy,
) -> Option<usize> {
    let mut eligible = candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.is_eligible(requirements))
        .map(|(i, _)| i);

    match policy {
        SelectionPolicy::FirstMatch => eligible.next(),
        SelectionPolicy::LastMatch => eligible.last(),
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<Instance>,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,

    // Cached for memory-type selection
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Pick a physical device and create the logical device.
    ///
    /// Without a surface the device is headless: presentation checks are
    /// skipped and no device extensions are required.
    pub fn new(
        instance: Arc<Instance>,
        surface: Option<&Surface>,
        requirements: &DeviceRequirements,
        policy: SelectionPolicy,
    ) -> GfxResult<Arc<Self>> {
        let swapchain_extension = [khr::Swapchain::name()];
        let required_extensions: &[&CStr] = if surface.is_some() {
            &swapchain_extension
        } else {
            &[]
        };

        let physical_devices = unsafe { instance.instance.enumerate_physical_devices() }
            .check("vkEnumeratePhysicalDevices")?;
        if physical_devices.is_empty() {
            return Err(GfxError::NoDevices);
        }

        let candidates = physical_devices
            .iter()
            .map(|&pd| describe_candidate(&instance.instance, pd, surface, required_extensions))
            .collect::<GfxResult<Vec<_>>>()?;

        for candidate in &candidates {
            log::debug!(
                "Candidate {:?}: type {:?}, eligible {}",
                candidate.name,
                candidate.device_type,
                candidate.is_eligible(requirements)
            );
        }

        let selected = select_device(&candidates, requirements, policy).ok_or(
            GfxError::NoEligibleDevice {
                candidates: candidates.len(),
            },
        )?;
        let physical_device = physical_devices[selected];
        let candidate = &candidates[selected];
        let queue_families = candidate
            .queue_families()
            .ok_or(GfxError::NoEligibleDevice {
                candidates: candidates.len(),
            })?;

        let device = create_logical_device(
            &instance,
            physical_device,
            &queue_families,
            required_extensions,
            requirements.require_geometry_shader,
        )?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        let properties = unsafe {
            instance.instance.get_physical_device_properties(physical_device)
        };
        let memory_properties = unsafe {
            instance.instance.get_physical_device_memory_properties(physical_device)
        };

        log::info!("Selected GPU: {} ({:?})", candidate.name, candidate.device_type);
        log::info!("API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version));
        log::info!(
            "Queue families: graphics {}, present {}",
            queue_families.graphics,
            queue_families.present
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            graphics_queue,
            present_queue,
            queue_families,
            memory_properties,
        }))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device_wait_idle() }.check("vkDeviceWaitIdle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        log_failure("Failed to idle device before destroying it", self.wait_idle());

        unsafe {
            self.device.destroy_device(None);
        }
    }
}

fn describe_candidate(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<&Surface>,
    required_extensions: &[&CStr],
) -> GfxResult<DeviceCandidate> {
    let props = unsafe { instance.get_physical_device_properties(physical_device) };
    let features = unsafe { instance.get_physical_device_features(physical_device) };
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let graphics_family = queue_families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32);

    let (present_family, surface_adequate) = match surface {
        Some(surface) => {
            let mut present_family = None;
            for index in 0..queue_families.len() as u32 {
                if surface.supports_present(physical_device, index)? {
                    present_family = Some(index);
                    break;
                }
            }
            (present_family, surface.query_support(physical_device)?.is_adequate())
        }
        // headless: nothing to present to
        None => (graphics_family, true),
    };

    let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .check("vkEnumerateDeviceExtensionProperties")?;
    let extensions_supported = required_extensions.iter().all(|required| {
        available
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *required)
    });

    Ok(DeviceCandidate {
        name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned(),
        device_type: props.device_type,
        geometry_shader: features.geometry_shader == vk::TRUE,
        graphics_family,
        present_family,
        extensions_supported,
        surface_adequate,
    })
}

fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
    extensions: &[&CStr],
    geometry_shader: bool,
) -> GfxResult<ash::Device> {
    let queue_priorities = [1.0];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures {
        geometry_shader: geometry_shader.into(),
        ..Default::default()
    };

    let extension_names: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    unsafe { instance.instance.create_device(physical_device, &create_info, None) }
        .check("vkCreateDevice")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eligible(name: &str) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            geometry_shader: true,
            graphics_family: Some(0),
            present_family: Some(0),
            extensions_supported: true,
            surface_adequate: true,
        }
    }

    fn integrated(name: &str) -> DeviceCandidate {
        DeviceCandidate {
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            ..eligible(name)
        }
    }

    #[test]
    fn only_third_device_qualifies() {
        let candidates = [
            integrated("igpu"),
            DeviceCandidate {
                geometry_shader: false,
                ..eligible("no-geom")
            },
            eligible("dgpu"),
        ];
        let requirements = DeviceRequirements::default();

        assert_eq!(
            select_device(&candidates, &requirements, SelectionPolicy::LastMatch),
            Some(2)
        );
        assert_eq!(
            select_device(&candidates, &requirements, SelectionPolicy::FirstMatch),
            Some(2)
        );
    }

    #[test]
    fn last_eligible_device_wins() {
        let candidates = [eligible("first"), integrated("middle"), eligible("third")];
        let requirements = DeviceRequirements::default();

        assert_eq!(
            select_device(&candidates, &requirements, SelectionPolicy::LastMatch),
            Some(2)
        );
        assert_eq!(
            select_device(&candidates, &requirements, SelectionPolicy::FirstMatch),
            Some(0)
        );
    }

    #[test]
    fn each_predicate_is_required() {
        let requirements = DeviceRequirements::default();
        let failing = [
            DeviceCandidate { graphics_family: None, ..eligible("a") },
            DeviceCandidate { present_family: None, ..eligible("b") },
            DeviceCandidate { extensions_supported: false, ..eligible("c") },
            DeviceCandidate { surface_adequate: false, ..eligible("d") },
            DeviceCandidate {
                device_type: vk::PhysicalDeviceType::CPU,
                ..eligible("e")
            },
            DeviceCandidate { geometry_shader: false, ..eligible("f") },
        ];

        for candidate in &failing {
            assert!(!candidate.is_eligible(&requirements), "{} passed", candidate.name);
        }
        assert_eq!(
            select_device(&failing, &requirements, SelectionPolicy::LastMatch),
            None
        );
    }

    #[test]
    fn relaxed_requirements_accept_integrated_gpus() {
        let requirements = DeviceRequirements {
            require_discrete_gpu: false,
            require_geometry_shader: false,
        };
        let candidate = DeviceCandidate {
            geometry_shader: false,
            ..integrated("igpu")
        };
        assert!(candidate.is_eligible(&requirements));
    }

    #[test]
    fn shared_family_creates_one_queue() {
        let shared = QueueFamilyIndices { graphics: 1, present: 1 };
        assert!(shared.is_shared());
        assert_eq!(shared.unique(), vec![1]);

        let split = QueueFamilyIndices { graphics: 2, present: 0 };
        assert!(!split.is_shared());
        assert_eq!(split.unique(), vec![0, 2]);
    }
}

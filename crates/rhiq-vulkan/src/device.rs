//! Headless Vulkan 1.2 device with timeline semaphores enabled.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use rhiq_core::{RecoveryOptions, RhiError};
use rhiq_device::DeviceRecreator;

use crate::error::vk_error;

/// Identity of a physical adapter, used to find it again after a loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    adapter: AdapterInfo,
}

pub struct VulkanDevice {
    // Dropped last; the instance and device function tables point into it.
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue_family: u32,
    adapter: AdapterInfo,
}

impl VulkanDevice {
    /// Create a device on the first adapter that supports Vulkan 1.2 timeline
    /// semaphores and has a graphics queue, trying `preferred` first.
    pub fn create(preferred: Option<&AdapterInfo>) -> Result<Self, RhiError> {
        // SAFETY: loading the system Vulkan loader has no preconditions beyond
        // the library being well-behaved.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RhiError::Backend(format!("failed to load Vulkan: {}", e)))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"rhiq")
            .engine_name(c"rhiq")
            .api_version(vk::API_VERSION_1_2);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| vk_error("create instance", e))?;

        match Self::open(&instance, preferred) {
            Ok((candidate, device)) => {
                info!(
                    adapter = %candidate.adapter.name,
                    queue_family = candidate.queue_family,
                    "Vulkan device created"
                );
                Ok(Self {
                    _entry: entry,
                    instance,
                    physical_device: candidate.physical_device,
                    device,
                    queue_family: candidate.queue_family,
                    adapter: candidate.adapter,
                })
            }
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn open(
        instance: &ash::Instance,
        preferred: Option<&AdapterInfo>,
    ) -> Result<(Candidate, ash::Device), RhiError> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| vk_error("enumerate physical devices", e))?;

        let mut candidates: Vec<Candidate> = physical_devices
            .into_iter()
            .filter_map(|pd| Self::inspect(instance, pd))
            .collect();
        if let Some(preferred) = preferred {
            // Stable sort keeps enumeration order among the rest.
            candidates.sort_by_key(|c| {
                !(c.adapter.vendor_id == preferred.vendor_id && c.adapter.device_id == preferred.device_id)
            });
        }
        let candidate = candidates.into_iter().next().ok_or_else(|| {
            RhiError::Backend("no adapter with Vulkan 1.2 timeline semaphores and a graphics queue".to_string())
        })?;

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(candidate.queue_family)
            .queue_priorities(&priorities)];
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .push_next(&mut vulkan12);

        let device = unsafe { instance.create_device(candidate.physical_device, &device_info, None) }
            .map_err(|e| vk_error("create device", e))?;
        Ok((candidate, device))
    }

    fn inspect(instance: &ash::Instance, pd: vk::PhysicalDevice) -> Option<Candidate> {
        let props = unsafe { instance.get_physical_device_properties(pd) };
        let name = props
            .device_name_as_c_str()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if props.api_version < vk::API_VERSION_1_2 {
            debug!(adapter = %name, "skipping adapter without Vulkan 1.2");
            return None;
        }

        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan12);
        unsafe { instance.get_physical_device_features2(pd, &mut features) };
        if vulkan12.timeline_semaphore != vk::TRUE {
            debug!(adapter = %name, "skipping adapter without timeline semaphores");
            return None;
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(pd) };
        let queue_family = families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))? as u32;

        Some(Candidate {
            physical_device: pd,
            queue_family,
            adapter: AdapterInfo {
                name,
                vendor_id: props.vendor_id,
                device_id: props.device_id,
            },
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// The single queue created on the graphics family.
    pub fn graphics_queue(&self) -> vk::Queue {
        unsafe { self.device.get_device_queue(self.queue_family, 0) }
    }

    pub fn wait_idle(&self) -> Result<(), RhiError> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| vk_error("device wait idle", e))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            warn!("destroying device without idle wait: {}", e);
        }
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Recreates [`VulkanDevice`]s for the recovery manager, remembering the
/// adapter of the last device it handed out.
pub struct VulkanRecreator {
    last_adapter: Mutex<Option<AdapterInfo>>,
}

impl VulkanRecreator {
    pub fn new(current: Option<AdapterInfo>) -> Self {
        Self {
            last_adapter: Mutex::new(current),
        }
    }
}

impl DeviceRecreator<VulkanDevice> for VulkanRecreator {
    fn recreate_device(&self, options: &RecoveryOptions) -> Result<Arc<VulkanDevice>, RhiError> {
        let preferred = if options.prefer_same_adapter {
            self.last_adapter.lock().clone()
        } else {
            None
        };
        let device = VulkanDevice::create(preferred.as_ref())?;
        if let Some(preferred) = &preferred {
            if device.adapter() != preferred {
                warn!(
                    wanted = %preferred.name,
                    got = %device.adapter().name,
                    "recovered on a different adapter"
                );
            }
        }
        *self.last_adapter.lock() = Some(device.adapter().clone());
        Ok(Arc::new(device))
    }
}

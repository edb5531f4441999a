use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::warn;

use rhiq_core::{Fence, RhiError};

use crate::device::VulkanDevice;
use crate::error::vk_error;

/// [`Fence`] backed by a timeline semaphore.
pub struct TimelineFence {
    device: Arc<VulkanDevice>,
    semaphore: vk::Semaphore,
    name: String,
    /// Highest value read back so far; returned when a readback fails.
    last_seen: AtomicU64,
}

impl TimelineFence {
    pub fn new(device: Arc<VulkanDevice>, name: impl Into<String>, initial: u64) -> Result<Self, RhiError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { device.device().create_semaphore(&create_info, None) }
            .map_err(|e| vk_error("create timeline semaphore", e))?;
        Ok(Self {
            device,
            semaphore,
            name: name.into(),
            last_seen: AtomicU64::new(initial),
        })
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    /// Read the counter, surfacing device loss instead of hiding it.
    pub fn try_completed_value(&self) -> Result<u64, RhiError> {
        let value = unsafe { self.device.device().get_semaphore_counter_value(self.semaphore) }
            .map_err(|e| vk_error("get semaphore counter value", e))?;
        self.last_seen.fetch_max(value, Ordering::AcqRel);
        Ok(value)
    }

    /// Advance the counter from the host.
    pub fn host_signal(&self, value: u64) -> Result<(), RhiError> {
        let info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.semaphore)
            .value(value);
        unsafe { self.device.device().signal_semaphore(&info) }.map_err(|e| vk_error("signal semaphore", e))
    }
}

impl Fence for TimelineFence {
    fn completed_value(&self) -> u64 {
        match self.try_completed_value() {
            Ok(value) => value,
            Err(e) => {
                warn!(fence = %self.name, "counter readback failed: {}", e);
                self.last_seen.load(Ordering::Acquire)
            }
        }
    }

    fn wait_until(&self, value: u64, timeout: Duration) -> Result<bool, RhiError> {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.device().wait_semaphores(&info, timeout_ns) } {
            Ok(()) => {
                self.last_seen.fetch_max(value, Ordering::AcqRel);
                Ok(true)
            }
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(vk_error("wait semaphores", e)),
        }
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        unsafe { self.device.device().destroy_semaphore(self.semaphore, None) };
    }
}

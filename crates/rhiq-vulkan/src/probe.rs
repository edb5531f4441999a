use std::sync::Arc;

use ash::vk;

use rhiq_core::RhiError;
use rhiq_device::{DeviceLossProbe, DeviceLostInfo, DeviceLostReason};

use crate::fence::TimelineFence;

/// Detects device loss through a timeline counter query, which fails with
/// `ERROR_DEVICE_LOST` once the device is gone.
pub struct VulkanLossProbe {
    fence: Arc<TimelineFence>,
}

impl VulkanLossProbe {
    pub fn new(fence: Arc<TimelineFence>) -> Self {
        Self { fence }
    }
}

impl DeviceLossProbe for VulkanLossProbe {
    fn check(&self) -> Option<DeviceLostInfo> {
        match self.fence.try_completed_value() {
            Err(RhiError::DeviceLost { reason }) => Some(
                DeviceLostInfo::new(DeviceLostReason::Unknown, reason)
                    .with_native_error_code(vk::Result::ERROR_DEVICE_LOST.as_raw()),
            ),
            _ => None,
        }
    }
}

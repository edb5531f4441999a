use ash::vk;

use rhiq_core::RhiError;

/// Map a failed Vulkan call onto [`RhiError`]. `ERROR_DEVICE_LOST` becomes
/// [`RhiError::DeviceLost`] so the worker threads report it.
pub fn vk_error(context: &str, result: vk::Result) -> RhiError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost {
            reason: format!("{}: {:?}", context, result),
        },
        _ => RhiError::Backend(format!("{}: {:?} ({})", context, result, result.as_raw())),
    }
}

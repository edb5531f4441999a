//! Integration test: Vulkan timeline fences and queues
//!
//! Needs a Vulkan 1.2 driver; each test returns early when none is available.
//!
//! Run with: cargo test -p rhiq-vulkan --test vulkan_test -- --nocapture

use std::sync::Arc;
use std::time::Duration;

use rhiq_core::sim::SimFence;
use rhiq_core::{Fence, HardwareQueue, RecoveryOptions, RhiError};
use rhiq_device::{DeviceLossProbe, DeviceRecreator};
use rhiq_vulkan::{TimelineFence, VulkanDevice, VulkanLossProbe, VulkanQueue, VulkanRecreator};

fn try_device() -> Option<Arc<VulkanDevice>> {
    rhiq_common::try_init_test_logging();
    match VulkanDevice::create(None) {
        Ok(device) => Some(Arc::new(device)),
        Err(e) => {
            eprintln!("skipping: no usable Vulkan device ({})", e);
            None
        }
    }
}

#[test]
fn test_timeline_fence_host_signal() {
    let Some(device) = try_device() else { return };
    let fence = TimelineFence::new(device, "graphics", 3).unwrap();

    assert_eq!(fence.completed_value(), 3);
    assert!(!fence.wait_until(4, Duration::from_millis(10)).unwrap());

    fence.host_signal(5).unwrap();
    assert_eq!(fence.completed_value(), 5);
    assert!(fence.wait_until(4, Duration::from_secs(1)).unwrap());
}

#[test]
fn test_signal_only_submit_advances_timeline() {
    let Some(device) = try_device() else { return };
    let fence = TimelineFence::new(device.clone(), "graphics", 0).unwrap();
    let queue = VulkanQueue::graphics(device.clone());

    queue.signal(&fence, 1).unwrap();
    queue.submit(&[], &fence, 2).unwrap();
    assert!(fence.wait_until(2, Duration::from_secs(5)).unwrap());
    device.wait_idle().unwrap();
}

#[test]
fn test_queue_rejects_foreign_fence() {
    let Some(device) = try_device() else { return };
    let queue = VulkanQueue::graphics(device);
    let sim = SimFence::new("sim", 0);

    let err = queue.signal(&sim, 1).unwrap_err();
    assert!(matches!(err, RhiError::Backend(_)));
}

#[test]
fn test_probe_on_healthy_device() {
    let Some(device) = try_device() else { return };
    let fence = Arc::new(TimelineFence::new(device, "graphics", 0).unwrap());
    let probe = VulkanLossProbe::new(fence);
    assert!(probe.check().is_none());
}

#[test]
fn test_recreator_prefers_same_adapter() {
    let Some(device) = try_device() else { return };
    let recreator = VulkanRecreator::new(Some(device.adapter().clone()));

    let recreated = recreator.recreate_device(&RecoveryOptions::default()).unwrap();
    assert_eq!(recreated.adapter(), device.adapter());
}

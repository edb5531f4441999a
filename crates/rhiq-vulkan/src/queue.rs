use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::trace;

use rhiq_core::{Fence, HardwareQueue, QueueType, RhiError};

use crate::device::VulkanDevice;
use crate::error::vk_error;
use crate::fence::TimelineFence;

/// A `vk::Queue` that signals a [`TimelineFence`] on every submit.
pub struct VulkanQueue {
    device: Arc<VulkanDevice>,
    queue: vk::Queue,
    queue_type: QueueType,
    /// vkQueueSubmit requires external synchronization on the queue.
    submit_lock: Mutex<()>,
}

impl VulkanQueue {
    pub fn new(device: Arc<VulkanDevice>, queue: vk::Queue, queue_type: QueueType) -> Self {
        Self {
            device,
            queue,
            queue_type,
            submit_lock: Mutex::new(()),
        }
    }

    /// The device's graphics queue.
    pub fn graphics(device: Arc<VulkanDevice>) -> Self {
        let queue = device.graphics_queue();
        Self::new(device, queue, QueueType::Graphics)
    }

    pub fn raw(&self) -> vk::Queue {
        self.queue
    }

    fn timeline<'a>(&self, fence: &'a dyn Fence) -> Result<&'a TimelineFence, RhiError> {
        fence.as_any().downcast_ref::<TimelineFence>().ok_or_else(|| {
            RhiError::Backend(format!(
                "{} queue needs a timeline fence, got {}",
                self.queue_type,
                fence.debug_name()
            ))
        })
    }

    fn submit_raw(&self, lists: &[vk::CommandBuffer], fence: &dyn Fence, signal_value: u64) -> Result<(), RhiError> {
        let timeline = self.timeline(fence)?;
        let signal_semaphores = [timeline.semaphore()];
        let signal_values = [signal_value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&signal_values);
        let submit = vk::SubmitInfo::default()
            .command_buffers(lists)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let _guard = self.submit_lock.lock();
        unsafe {
            self.device
                .device()
                .queue_submit(self.queue, &[submit], vk::Fence::null())
        }
        .map_err(|e| vk_error("queue submit", e))?;
        trace!(queue = %self.queue_type, command_buffers = lists.len(), signal_value, "vulkan submit");
        Ok(())
    }
}

impl HardwareQueue<vk::CommandBuffer> for VulkanQueue {
    fn submit(&self, lists: &[vk::CommandBuffer], fence: &dyn Fence, signal_value: u64) -> Result<(), RhiError> {
        self.submit_raw(lists, fence, signal_value)
    }

    /// An empty submit that only signals the timeline.
    fn signal(&self, fence: &dyn Fence, value: u64) -> Result<(), RhiError> {
        self.submit_raw(&[], fence, value)
    }
}

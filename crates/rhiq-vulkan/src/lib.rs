//! Vulkan implementation of the pipeline's backend seams.
//!
//! Fences are Vulkan 1.2 timeline semaphores and hardware queues submit
//! `vk::CommandBuffer`s with a timeline signal. Command pools and buffers are
//! left to the application.

pub mod device;
pub mod error;
pub mod fence;
pub mod probe;
pub mod queue;

pub use device::{AdapterInfo, VulkanDevice, VulkanRecreator};
pub use error::vk_error;
pub use fence::TimelineFence;
pub use probe::VulkanLossProbe;
pub use queue::VulkanQueue;

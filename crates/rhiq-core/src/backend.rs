//! Backend seams: the object factory used by [`crate::ObjectPool`] and the
//! hardware queue used by the submission thread.

use crate::error::RhiError;
use crate::fence::Fence;
use crate::queue::QueueType;

/// Constructs and resets the recording objects recycled by the object pools.
///
/// Construction failures are treated as fatal by the pool; a backend should
/// only return `Err` when the device is unusable.
pub trait Backend: Send + Sync + 'static {
    type Allocator: Send + 'static;
    type CommandList: Send + 'static;
    type Context: Send + 'static;

    fn create_command_allocator(&self, queue: QueueType) -> Result<Self::Allocator, RhiError>;

    /// Prepare an idle allocator for reuse. Only called once the allocator's
    /// gating fence value has completed.
    fn reset_command_allocator(&self, allocator: &mut Self::Allocator) -> Result<(), RhiError>;

    fn create_command_list(
        &self,
        queue: QueueType,
        allocator: &Self::Allocator,
    ) -> Result<Self::CommandList, RhiError>;

    /// Re-open a recycled command list against a (possibly different) allocator.
    fn reset_command_list(
        &self,
        list: &mut Self::CommandList,
        allocator: &Self::Allocator,
    ) -> Result<(), RhiError>;

    fn create_context(&self, queue: QueueType) -> Result<Self::Context, RhiError>;
}

/// A hardware submission queue for command lists of type `L`.
pub trait HardwareQueue<L>: Send + Sync + 'static {
    /// Execute `lists` in order and signal `fence` to `signal_value` once the
    /// GPU has finished them.
    fn submit(&self, lists: &[L], fence: &dyn Fence, signal_value: u64) -> Result<(), RhiError>;

    /// Signal `fence` to `value` after all previously submitted work.
    fn signal(&self, fence: &dyn Fence, value: u64) -> Result<(), RhiError>;
}

use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::RhiError;
use crate::fence::Fence;
use crate::queue::QueueType;

/// Invoked on the interrupt thread once a payload's fence value completes.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// A bundle of recorded command lists submitted together to one hardware queue.
///
/// Built by a recording thread and moved into the submission thread, which
/// stamps the fence value at enqueue time.
pub struct Payload<B: Backend> {
    pub(crate) queue_type: QueueType,
    pub(crate) command_lists: Vec<B::CommandList>,
    pub(crate) fence_value: u64,
    pub(crate) allocators: Vec<B::Allocator>,
    pub(crate) on_complete: Option<CompletionCallback>,
}

impl<B: Backend> Payload<B> {
    /// Create an unstamped payload. The allocator set must be non-empty exactly
    /// when the command-list set is.
    pub fn new(
        queue_type: QueueType,
        command_lists: Vec<B::CommandList>,
        allocators: Vec<B::Allocator>,
    ) -> Result<Self, RhiError> {
        if command_lists.is_empty() != allocators.is_empty() {
            return Err(RhiError::InvalidPayload(format!(
                "{} command list(s) backed by {} allocator(s)",
                command_lists.len(),
                allocators.len()
            )));
        }
        Ok(Self {
            queue_type,
            command_lists,
            fence_value: 0,
            allocators,
            on_complete: None,
        })
    }

    /// A payload carrying no work; it only advances the queue's fence.
    pub fn signal_only(queue_type: QueueType) -> Self {
        Self {
            queue_type,
            command_lists: Vec::new(),
            fence_value: 0,
            allocators: Vec::new(),
            on_complete: None,
        }
    }

    pub fn with_completion(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Fence value assigned at enqueue; zero while unstamped.
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn command_list_count(&self) -> usize {
        self.command_lists.len()
    }

    pub fn allocator_count(&self) -> usize {
        self.allocators.len()
    }

    pub fn is_signal_only(&self) -> bool {
        self.command_lists.is_empty()
    }

    /// Stamp the completion value. Only the submission queue does this, while
    /// holding its lock.
    #[doc(hidden)]
    pub fn stamp(&mut self, fence_value: u64) {
        self.fence_value = fence_value;
    }

    /// Split the payload into the parts consumed by the submission thread.
    #[doc(hidden)]
    pub fn into_parts(self) -> PayloadParts<B> {
        PayloadParts {
            queue_type: self.queue_type,
            command_lists: self.command_lists,
            fence_value: self.fence_value,
            allocators: self.allocators,
            on_complete: self.on_complete,
        }
    }
}

impl<B: Backend> fmt::Debug for Payload<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("queue_type", &self.queue_type)
            .field("command_lists", &self.command_lists.len())
            .field("fence_value", &self.fence_value)
            .field("allocators", &self.allocators.len())
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

/// Destructured payload.
pub struct PayloadParts<B: Backend> {
    pub queue_type: QueueType,
    pub command_lists: Vec<B::CommandList>,
    pub fence_value: u64,
    pub allocators: Vec<B::Allocator>,
    pub on_complete: Option<CompletionCallback>,
}

/// Completion-wait entry forwarded from the submission thread to the
/// interrupt thread, one per submitted payload.
pub struct PendingInterrupt<B: Backend> {
    pub queue_type: QueueType,
    pub fence: Arc<dyn Fence>,
    pub fence_value: u64,
    /// Released to the queue's pool once `fence_value` completes.
    pub allocators: Vec<B::Allocator>,
    pub callback: Option<CompletionCallback>,
}

impl<B: Backend> PendingInterrupt<B> {
    pub fn new(
        queue_type: QueueType,
        fence: Arc<dyn Fence>,
        fence_value: u64,
        allocators: Vec<B::Allocator>,
    ) -> Self {
        Self {
            queue_type,
            fence,
            fence_value,
            allocators,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl<B: Backend> fmt::Debug for PendingInterrupt<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingInterrupt")
            .field("queue_type", &self.queue_type)
            .field("fence", &self.fence.debug_name())
            .field("fence_value", &self.fence_value)
            .field("allocators", &self.allocators.len())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

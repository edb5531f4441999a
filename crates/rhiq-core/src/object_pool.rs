//! Per-queue recycling of command allocators, command lists and contexts.
//!
//! Lists and contexts are reusable as soon as they are returned. Allocators
//! are the gating resource: a released allocator sits in the pending list,
//! tagged with a fence/value pair, until [`ObjectPool::trim`] observes that
//! the value has completed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::Backend;
use crate::error::fatal;
use crate::fence::{same_fence, Fence};
use crate::queue::QueueType;

/// An allocator checked in together with the value that must complete
/// before it may be reset.
pub struct PooledAllocator<A> {
    pub allocator: A,
    pub fence: Arc<dyn Fence>,
    pub fence_value: u64,
}

impl<A> PooledAllocator<A> {
    fn is_complete(&self, completed: u64) -> bool {
        completed >= self.fence_value
    }
}

struct PoolState<B: Backend> {
    free_allocators: Vec<B::Allocator>,
    pending_allocators: Vec<PooledAllocator<B::Allocator>>,
    free_command_lists: Vec<B::CommandList>,
    free_contexts: Vec<B::Context>,
}

impl<B: Backend> PoolState<B> {
    fn new() -> Self {
        Self {
            free_allocators: Vec::new(),
            pending_allocators: Vec::new(),
            free_command_lists: Vec::new(),
            free_contexts: Vec::new(),
        }
    }
}

/// Point-in-time view of a pool's lists and lifetime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub queue_type: QueueType,
    pub free_allocators: usize,
    pub pending_allocators: usize,
    pub free_command_lists: usize,
    pub free_contexts: usize,
    pub created_allocators: usize,
    pub created_command_lists: usize,
    pub created_contexts: usize,
}

pub struct ObjectPool<B: Backend> {
    queue_type: QueueType,
    backend: Arc<B>,
    state: Mutex<PoolState<B>>,
    created_allocators: AtomicUsize,
    created_command_lists: AtomicUsize,
    created_contexts: AtomicUsize,
}

impl<B: Backend> ObjectPool<B> {
    pub fn new(queue_type: QueueType, backend: Arc<B>) -> Self {
        Self {
            queue_type,
            backend,
            state: Mutex::new(PoolState::new()),
            created_allocators: AtomicUsize::new(0),
            created_command_lists: AtomicUsize::new(0),
            created_contexts: AtomicUsize::new(0),
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    // ── Obtain ──────────────────────────────────────────────

    pub fn obtain_context(&self) -> B::Context {
        if let Some(ctx) = self.state.lock().free_contexts.pop() {
            return ctx;
        }
        match self.backend.create_context(self.queue_type) {
            Ok(ctx) => {
                self.created_contexts.fetch_add(1, Ordering::Relaxed);
                ctx
            }
            Err(e) => fatal("command context construction failed", e),
        }
    }

    /// Hand out an idle allocator, constructing one if none has completed.
    pub fn obtain_command_allocator(&self) -> B::Allocator {
        let recycled = self.state.lock().free_allocators.pop();
        if let Some(mut allocator) = recycled {
            if let Err(e) = self.backend.reset_command_allocator(&mut allocator) {
                fatal("command allocator reset failed", e);
            }
            return allocator;
        }
        match self.backend.create_command_allocator(self.queue_type) {
            Ok(allocator) => {
                let total = self.created_allocators.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(queue = %self.queue_type, total, "created command allocator");
                allocator
            }
            Err(e) => fatal("command allocator construction failed", e),
        }
    }

    pub fn obtain_command_list(&self, allocator: &B::Allocator) -> B::CommandList {
        let recycled = self.state.lock().free_command_lists.pop();
        if let Some(mut list) = recycled {
            if let Err(e) = self.backend.reset_command_list(&mut list, allocator) {
                fatal("command list reset failed", e);
            }
            return list;
        }
        match self.backend.create_command_list(self.queue_type, allocator) {
            Ok(list) => {
                self.created_command_lists.fetch_add(1, Ordering::Relaxed);
                list
            }
            Err(e) => fatal("command list construction failed", e),
        }
    }

    // ── Release ─────────────────────────────────────────────

    pub fn release_context(&self, ctx: B::Context) {
        self.state.lock().free_contexts.push(ctx);
    }

    pub fn release_command_list(&self, list: B::CommandList) {
        self.state.lock().free_command_lists.push(list);
    }

    pub fn release_command_lists(&self, lists: impl IntoIterator<Item = B::CommandList>) {
        self.state.lock().free_command_lists.extend(lists);
    }

    /// Check an allocator in as pending. It becomes reusable only after a
    /// [`trim`](Self::trim) observes `fence` at or past `fence_value`.
    pub fn release_command_allocator(
        &self,
        allocator: B::Allocator,
        fence: Arc<dyn Fence>,
        fence_value: u64,
    ) {
        self.state.lock().pending_allocators.push(PooledAllocator {
            allocator,
            fence,
            fence_value,
        });
    }

    /// Move every pending allocator whose fence value has completed to the
    /// free list. Each distinct fence is read once per pass.
    pub fn trim(&self) -> usize {
        let mut state = self.state.lock();
        if state.pending_allocators.is_empty() {
            return 0;
        }

        let mut completed: Vec<(Arc<dyn Fence>, u64)> = Vec::new();
        let pending = std::mem::take(&mut state.pending_allocators);
        let mut moved = 0;

        for entry in pending {
            let value = match completed.iter().find(|(f, _)| same_fence(f, &entry.fence)) {
                Some((_, v)) => *v,
                None => {
                    let v = entry.fence.completed_value();
                    completed.push((Arc::clone(&entry.fence), v));
                    v
                }
            };
            if entry.is_complete(value) {
                state.free_allocators.push(entry.allocator);
                moved += 1;
            } else {
                state.pending_allocators.push(entry);
            }
        }

        if moved > 0 {
            trace!(
                queue = %self.queue_type,
                moved,
                still_pending = state.pending_allocators.len(),
                "trimmed pending allocators"
            );
        }
        moved
    }

    /// Drop every tracked object. Shutdown only: the caller guarantees the GPU
    /// holds no references to any of them.
    pub fn release_all(&self) -> usize {
        let drained = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, PoolState::new())
        };
        let count = drained.free_allocators.len()
            + drained.pending_allocators.len()
            + drained.free_command_lists.len()
            + drained.free_contexts.len();
        drop(drained);
        debug!(queue = %self.queue_type, count, "released all pooled objects");
        count
    }

    // ── Queries ─────────────────────────────────────────────

    /// Number of allocators ready for reuse.
    pub fn available_count(&self) -> usize {
        self.state.lock().free_allocators.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending_allocators.len()
    }

    pub fn free_command_list_count(&self) -> usize {
        self.state.lock().free_command_lists.len()
    }

    pub fn free_context_count(&self) -> usize {
        self.state.lock().free_contexts.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            queue_type: self.queue_type,
            free_allocators: state.free_allocators.len(),
            pending_allocators: state.pending_allocators.len(),
            free_command_lists: state.free_command_lists.len(),
            free_contexts: state.free_contexts.len(),
            created_allocators: self.created_allocators.load(Ordering::Relaxed),
            created_command_lists: self.created_command_lists.load(Ordering::Relaxed),
            created_contexts: self.created_contexts.load(Ordering::Relaxed),
        }
    }
}

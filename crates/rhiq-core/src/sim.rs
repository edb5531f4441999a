//! Simulated backend.
//!
//! A CPU-only stand-in for a GPU: fences are mutex/condvar counters, objects
//! are numbered structs, and queues complete work immediately, after a fixed
//! latency, or only when a test signals the fence by hand. Used by the test
//! suites and by the `rhiq soak` driver.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::backend::{Backend, HardwareQueue};
use crate::error::RhiError;
use crate::fence::Fence;
use crate::handoff::HandoffQueue;
use crate::queue::QueueType;

// ── Fence ───────────────────────────────────────────────────

pub struct SimFence {
    name: String,
    completed: Mutex<u64>,
    advanced: Condvar,
    lost: AtomicBool,
    completed_reads: AtomicUsize,
    wait_calls: AtomicUsize,
}

impl SimFence {
    pub fn new(name: impl Into<String>, initial: u64) -> Self {
        Self {
            name: name.into(),
            completed: Mutex::new(initial),
            advanced: Condvar::new(),
            lost: AtomicBool::new(false),
            completed_reads: AtomicUsize::new(0),
            wait_calls: AtomicUsize::new(0),
        }
    }

    /// Advance the completed value. Values never move backwards.
    pub fn signal(&self, value: u64) {
        let mut completed = self.completed.lock();
        if value > *completed {
            *completed = value;
        }
        self.advanced.notify_all();
    }

    /// Make every subsequent wait fail with a device-lost error.
    pub fn lose_device(&self) {
        self.lost.store(true, Ordering::Release);
        self.advanced.notify_all();
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Number of `completed_value` readbacks so far.
    pub fn completed_reads(&self) -> usize {
        self.completed_reads.load(Ordering::Relaxed)
    }

    /// Number of `wait_until` calls so far.
    pub fn wait_calls(&self) -> usize {
        self.wait_calls.load(Ordering::Relaxed)
    }
}

impl Fence for SimFence {
    fn completed_value(&self) -> u64 {
        self.completed_reads.fetch_add(1, Ordering::Relaxed);
        *self.completed.lock()
    }

    fn wait_until(&self, value: u64, timeout: Duration) -> Result<bool, RhiError> {
        self.wait_calls.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let mut completed = self.completed.lock();
        loop {
            if self.is_lost() {
                return Err(RhiError::DeviceLost {
                    reason: format!("{} lost while waiting for {}", self.name, value),
                });
            }
            if *completed >= value {
                return Ok(true);
            }
            if self.advanced.wait_until(&mut completed, deadline).timed_out() {
                return Ok(*completed >= value);
            }
        }
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Objects ─────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub struct SimAllocator {
    pub id: u64,
    pub queue: QueueType,
    pub resets: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SimCommandList {
    pub id: u64,
    pub queue: QueueType,
    /// Allocator the list is currently recording into.
    pub allocator_id: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SimContext {
    pub id: u64,
    pub queue: QueueType,
}

/// Object factory handing out numbered objects.
pub struct SimBackend {
    next_id: AtomicU64,
    fail_creation: AtomicBool,
}

impl SimBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            fail_creation: AtomicBool::new(false),
        }
    }

    /// Make every subsequent construction fail.
    pub fn fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::Relaxed);
    }

    fn next_id(&self) -> Result<u64, RhiError> {
        if self.fail_creation.load(Ordering::Relaxed) {
            return Err(RhiError::Backend("simulated out of memory".to_string()));
        }
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SimBackend {
    type Allocator = SimAllocator;
    type CommandList = SimCommandList;
    type Context = SimContext;

    fn create_command_allocator(&self, queue: QueueType) -> Result<SimAllocator, RhiError> {
        Ok(SimAllocator {
            id: self.next_id()?,
            queue,
            resets: 0,
        })
    }

    fn reset_command_allocator(&self, allocator: &mut SimAllocator) -> Result<(), RhiError> {
        allocator.resets += 1;
        Ok(())
    }

    fn create_command_list(
        &self,
        queue: QueueType,
        allocator: &SimAllocator,
    ) -> Result<SimCommandList, RhiError> {
        Ok(SimCommandList {
            id: self.next_id()?,
            queue,
            allocator_id: allocator.id,
        })
    }

    fn reset_command_list(
        &self,
        list: &mut SimCommandList,
        allocator: &SimAllocator,
    ) -> Result<(), RhiError> {
        list.allocator_id = allocator.id;
        Ok(())
    }

    fn create_context(&self, queue: QueueType) -> Result<SimContext, RhiError> {
        Ok(SimContext {
            id: self.next_id()?,
            queue,
        })
    }
}

// ── Queue ───────────────────────────────────────────────────

/// How a [`SimQueue`] completes submitted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Signal the fence inside `submit`.
    Immediate,
    /// Signal the fence from a simulated GPU thread after a fixed latency.
    Delayed(Duration),
    /// Never signal; the test advances the fence itself.
    Manual,
}

/// One recorded hardware submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub command_list_ids: Vec<u64>,
    pub signal_value: u64,
}

pub struct SimQueue {
    queue_type: QueueType,
    fence: Arc<SimFence>,
    completion: Completion,
    records: Mutex<Vec<SubmitRecord>>,
    failing_submits: AtomicUsize,
    lost: AtomicBool,
    gpu: Option<SimGpu>,
}

impl SimQueue {
    pub fn new(queue_type: QueueType, fence: Arc<SimFence>, completion: Completion) -> Self {
        let gpu = match completion {
            Completion::Delayed(latency) => Some(SimGpu::spawn(queue_type, Arc::clone(&fence), latency)),
            _ => None,
        };
        Self {
            queue_type,
            fence,
            completion,
            records: Mutex::new(Vec::new()),
            failing_submits: AtomicUsize::new(0),
            lost: AtomicBool::new(false),
            gpu,
        }
    }

    pub fn fence(&self) -> &Arc<SimFence> {
        &self.fence
    }

    /// Make the next `count` submits fail.
    pub fn fail_next_submits(&self, count: usize) {
        self.failing_submits.store(count, Ordering::Relaxed);
    }

    /// Fail every subsequent submit with a device-lost error and poison the fence.
    pub fn lose_device(&self) {
        self.lost.store(true, Ordering::Release);
        self.fence.lose_device();
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn records(&self) -> Vec<SubmitRecord> {
        self.records.lock().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.records.lock().len()
    }

    fn check_fence(&self, fence: &dyn Fence) -> Result<(), RhiError> {
        match fence.as_any().downcast_ref::<SimFence>() {
            Some(f) if std::ptr::eq(f, Arc::as_ptr(&self.fence)) => Ok(()),
            _ => Err(RhiError::Backend(format!(
                "{} queue was handed a fence it does not own",
                self.queue_type
            ))),
        }
    }

    fn complete(&self, value: u64) {
        match (&self.completion, &self.gpu) {
            (Completion::Immediate, _) => self.fence.signal(value),
            (Completion::Delayed(_), Some(gpu)) => gpu.schedule(value),
            _ => {}
        }
    }
}

impl HardwareQueue<SimCommandList> for SimQueue {
    fn submit(
        &self,
        lists: &[SimCommandList],
        fence: &dyn Fence,
        signal_value: u64,
    ) -> Result<(), RhiError> {
        self.check_fence(fence)?;
        if self.is_lost() {
            return Err(RhiError::DeviceLost {
                reason: format!("{} queue submit after device loss", self.queue_type),
            });
        }
        let failing = self.failing_submits.load(Ordering::Relaxed);
        if failing > 0 {
            self.failing_submits.store(failing - 1, Ordering::Relaxed);
            return Err(RhiError::SubmitFailed("simulated submit failure".to_string()));
        }

        self.records.lock().push(SubmitRecord {
            command_list_ids: lists.iter().map(|l| l.id).collect(),
            signal_value,
        });
        self.complete(signal_value);
        Ok(())
    }

    fn signal(&self, fence: &dyn Fence, value: u64) -> Result<(), RhiError> {
        self.check_fence(fence)?;
        if self.is_lost() {
            return Err(RhiError::DeviceLost {
                reason: format!("{} queue signal after device loss", self.queue_type),
            });
        }
        self.complete(value);
        Ok(())
    }
}

/// Background thread standing in for the GPU executing a queue's work.
struct SimGpu {
    work: Arc<HandoffQueue<(u64, Instant)>>,
    thread: Option<JoinHandle<()>>,
}

impl SimGpu {
    fn spawn(queue_type: QueueType, fence: Arc<SimFence>, latency: Duration) -> Self {
        let work: Arc<HandoffQueue<(u64, Instant)>> = Arc::new(HandoffQueue::new());
        let worker_work = Arc::clone(&work);
        let thread = thread::Builder::new()
            .name(format!("sim-gpu-{}", queue_type))
            .spawn(move || {
                while let Some((value, submitted_at)) = worker_work.wait_pop() {
                    let due = submitted_at + latency;
                    let now = Instant::now();
                    if due > now {
                        thread::sleep(due - now);
                    }
                    if fence.is_lost() {
                        continue;
                    }
                    fence.signal(value);
                }
                debug!(queue = %queue_type, "simulated GPU thread exiting");
            });
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(queue = %queue_type, "failed to spawn simulated GPU thread: {}", e);
                None
            }
        };
        Self { work, thread }
    }

    fn schedule(&self, value: u64) {
        self.work.push((value, Instant::now()));
    }
}

impl Drop for SimGpu {
    fn drop(&mut self) {
        self.work.close();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

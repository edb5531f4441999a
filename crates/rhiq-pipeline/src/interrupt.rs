//! Interrupt thread: waits for submitted work to finish on the GPU and
//! recycles the command allocators it used.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use rhiq_core::config::InterruptConfig;
use rhiq_core::fence::same_fence;
use rhiq_core::{Backend, Fence, HandoffQueue, ObjectPool, PendingInterrupt, PerQueue, QueueType, RhiError};
use rhiq_device::{DeviceLostHandler, DeviceLostInfo};

use crate::worker::{StateCell, ThreadState, Worker};

const THREAD_NAME: &str = "rhiq-interrupt";

/// Extra time `stop` allows for the thread to notice its deadline and exit.
const JOIN_GRACE: Duration = Duration::from_millis(250);

struct InterruptShared<B: Backend> {
    queue: HandoffQueue<PendingInterrupt<B>>,
    pools: RwLock<PerQueue<Option<Arc<ObjectPool<B>>>>>,
    device_lost: RwLock<Option<Arc<DeviceLostHandler>>>,
    state: StateCell,
    /// Set by `stop`; fence waits never run past it.
    deadline: Mutex<Option<Instant>>,
    wait_slice: Duration,
    processed: AtomicU64,
    abandoned: AtomicU64,
}

/// Cloneable handle the submission thread uses to forward completion waits.
pub struct InterruptSender<B: Backend> {
    shared: Arc<InterruptShared<B>>,
}

impl<B: Backend> InterruptSender<B> {
    pub fn send(&self, entry: PendingInterrupt<B>) {
        self.shared.queue.push(entry);
    }
}

impl<B: Backend> Clone for InterruptSender<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

pub struct InterruptThread<B: Backend> {
    shared: Arc<InterruptShared<B>>,
    worker: Mutex<Worker>,
    config: InterruptConfig,
}

impl<B: Backend> InterruptThread<B> {
    pub fn new(config: InterruptConfig) -> Self {
        let shared = Arc::new(InterruptShared {
            queue: HandoffQueue::new(),
            pools: RwLock::new(PerQueue::from_fn(|_| None)),
            device_lost: RwLock::new(None),
            state: StateCell::new(),
            deadline: Mutex::new(None),
            wait_slice: config.wait_slice(),
            processed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        });
        Self {
            shared,
            worker: Mutex::new(Worker::idle(THREAD_NAME)),
            config,
        }
    }

    /// Pool that receives the allocators of entries on `queue`.
    pub fn set_object_pool(&self, queue: QueueType, pool: Arc<ObjectPool<B>>) {
        self.shared.pools.write()[queue] = Some(pool);
    }

    pub fn attach_device_lost_handler(&self, handler: Arc<DeviceLostHandler>) {
        *self.shared.device_lost.write() = Some(handler);
    }

    pub fn sender(&self) -> InterruptSender<B> {
        InterruptSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queue a completion wait. Entries are processed strictly in the order
    /// they arrive.
    pub fn enqueue_interrupt(&self, entry: PendingInterrupt<B>) {
        self.shared.queue.push(entry);
    }

    pub fn start(&self) -> Result<(), RhiError> {
        let mut worker = self.worker.lock();
        if worker.is_alive() {
            return match self.state() {
                ThreadState::Running => Ok(()),
                _ => Err(RhiError::Backend(format!(
                    "{} is still draining from a previous stop",
                    worker.name()
                ))),
            };
        }

        *self.shared.deadline.lock() = None;
        self.shared.queue.reopen();
        self.shared.state.store(ThreadState::Running);

        let shared = Arc::clone(&self.shared);
        if let Err(e) = worker.spawn(move || run(&*shared)) {
            self.shared.state.store(ThreadState::Stopped);
            return Err(e);
        }
        info!(wait_slice_ms = self.config.wait_slice_ms, "interrupt thread started");
        Ok(())
    }

    /// Drain the queued entries and stop. Fence waits are cut off at
    /// `now + timeout`; entries that miss it keep their allocators pending and
    /// lose their callback.
    pub fn stop(&self, timeout: Duration) -> Result<(), RhiError> {
        let mut worker = self.worker.lock();
        if !worker.is_alive() {
            return Ok(());
        }

        self.shared.state.store(ThreadState::Draining);
        *self.shared.deadline.lock() = Some(Instant::now() + timeout);
        self.shared.queue.close();

        if !worker.join_timeout(timeout + self.shared.wait_slice.max(JOIN_GRACE)) {
            error!(
                thread = THREAD_NAME,
                timeout_ms = timeout.as_millis() as u64,
                queued = self.shared.queue.len(),
                "interrupt thread did not stop in time"
            );
            return Err(RhiError::ShutdownTimeout {
                thread: THREAD_NAME,
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        self.shared.state.store(ThreadState::Stopped);
        info!(
            processed = self.processed_count(),
            abandoned = self.abandoned_count(),
            "interrupt thread stopped"
        );
        Ok(())
    }

    /// Stop with the configured timeout.
    pub fn shutdown(&self) -> Result<(), RhiError> {
        self.stop(self.config.stop_timeout())
    }

    pub fn state(&self) -> ThreadState {
        self.shared.state.load()
    }

    /// Entries whose fence completed and whose allocators were recycled.
    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Entries given up on because of a stop deadline or a failed wait.
    pub fn abandoned_count(&self) -> u64 {
        self.shared.abandoned.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }
}

impl<B: Backend> Drop for InterruptThread<B> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// ── Worker loop ─────────────────────────────────────────────

/// Last completed value observed for the fence of each queue.
type CompletedCache = PerQueue<Option<(Arc<dyn Fence>, u64)>>;

fn run<B: Backend>(shared: &InterruptShared<B>) {
    let mut cache: CompletedCache = PerQueue::from_fn(|_| None);

    while let Some(entry) = shared.queue.wait_pop() {
        match shared.wait_for(&entry, &mut cache) {
            Ok(true) => shared.complete(entry),
            Ok(false) => {
                error!(
                    queue = %entry.queue_type,
                    fence = entry.fence.debug_name(),
                    fence_value = entry.fence_value,
                    "stop deadline reached before fence completed; allocators stay pending"
                );
                shared.abandon(entry);
            }
            Err(e) => {
                error!(
                    queue = %entry.queue_type,
                    fence = entry.fence.debug_name(),
                    fence_value = entry.fence_value,
                    "fence wait failed: {}",
                    e
                );
                shared.report(&e);
                shared.abandon(entry);
            }
        }
    }
    debug!("interrupt thread exiting");
}

impl<B: Backend> InterruptShared<B> {
    /// Wait until the entry's fence value completes. `Ok(false)` means the
    /// stop deadline passed first.
    fn wait_for(&self, entry: &PendingInterrupt<B>, cache: &mut CompletedCache) -> Result<bool, RhiError> {
        let slot = cache.get_mut(entry.queue_type);
        if let Some((fence, completed)) = slot.as_ref() {
            if same_fence(fence, &entry.fence) && *completed >= entry.fence_value {
                trace!(queue = %entry.queue_type, fence_value = entry.fence_value, "satisfied by cached value");
                return Ok(true);
            }
        }

        let completed = entry.fence.completed_value();
        *slot = Some((Arc::clone(&entry.fence), completed));
        if completed >= entry.fence_value {
            return Ok(true);
        }

        loop {
            let slice = match *self.deadline.lock() {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(self.wait_slice)
                }
                None => self.wait_slice,
            };
            if entry.fence.wait_until(entry.fence_value, slice)? {
                *slot = Some((Arc::clone(&entry.fence), entry.fence_value));
                return Ok(true);
            }
        }
    }

    fn pool(&self, queue: QueueType) -> Option<Arc<ObjectPool<B>>> {
        self.pools.read()[queue].clone()
    }

    fn release_allocators(&self, entry: &mut PendingInterrupt<B>) -> Option<Arc<ObjectPool<B>>> {
        let Some(pool) = self.pool(entry.queue_type) else {
            warn!(
                queue = %entry.queue_type,
                allocators = entry.allocators.len(),
                "no object pool wired; dropping allocators"
            );
            entry.allocators.clear();
            return None;
        };
        for allocator in entry.allocators.drain(..) {
            pool.release_command_allocator(allocator, Arc::clone(&entry.fence), entry.fence_value);
        }
        Some(pool)
    }

    fn complete(&self, mut entry: PendingInterrupt<B>) {
        if let Some(pool) = self.release_allocators(&mut entry) {
            pool.trim();
        }
        if let Some(callback) = entry.callback.take() {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                warn!(queue = %entry.queue_type, fence_value = entry.fence_value, "completion callback panicked");
            }
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
        trace!(queue = %entry.queue_type, fence_value = entry.fence_value, "interrupt processed");
    }

    /// Keep the allocators gated by their fence; the callback never runs.
    fn abandon(&self, mut entry: PendingInterrupt<B>) {
        self.release_allocators(&mut entry);
        entry.callback = None;
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, err: &RhiError) {
        let Some(info) = DeviceLostInfo::from_error(err) else {
            return;
        };
        if let Some(handler) = self.device_lost.read().clone() {
            handler.report(info);
        }
    }
}

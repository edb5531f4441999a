//! Submission thread: batches enqueued payloads per queue, submits them to the
//! hardware queues, and forwards their completion waits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use rhiq_core::config::SubmissionConfig;
use rhiq_core::fence::same_fence;
use rhiq_core::{
    Backend, Fence, HandoffQueue, HardwareQueue, ObjectPool, Payload, PayloadParts, PendingInterrupt, PerQueue,
    QueueType, RhiError, SyncPoint,
};
use rhiq_device::{DeviceLostHandler, DeviceLostInfo};

use crate::interrupt::InterruptSender;
use crate::worker::{StateCell, ThreadState, Worker};

const THREAD_NAME: &str = "rhiq-submission";

/// Everything the submission thread needs to know about one queue type.
struct QueueWiring<B: Backend> {
    hardware: Option<Arc<dyn HardwareQueue<B::CommandList>>>,
    fence: Option<Arc<dyn Fence>>,
    /// Last fence value handed out on this queue.
    last_value: u64,
    pool: Option<Arc<ObjectPool<B>>>,
}

impl<B: Backend> QueueWiring<B> {
    fn empty() -> Self {
        Self {
            hardware: None,
            fence: None,
            last_value: 0,
            pool: None,
        }
    }
}

struct SubmissionShared<B: Backend> {
    queue: HandoffQueue<Payload<B>>,
    /// Locked after the handoff queue lock when stamping, never the other way.
    wiring: Mutex<PerQueue<QueueWiring<B>>>,
    interrupts: RwLock<Option<InterruptSender<B>>>,
    device_lost: RwLock<Option<Arc<DeviceLostHandler>>>,
    state: StateCell,
    max_batch_size: usize,
    submitted_payloads: AtomicU64,
    submitted_batches: AtomicU64,
    failed_batches: AtomicU64,
}

pub struct SubmissionThread<B: Backend> {
    shared: Arc<SubmissionShared<B>>,
    worker: Mutex<Worker>,
    config: SubmissionConfig,
}

impl<B: Backend> SubmissionThread<B> {
    pub fn new(config: SubmissionConfig) -> Self {
        let shared = Arc::new(SubmissionShared {
            queue: HandoffQueue::new(),
            wiring: Mutex::new(PerQueue::from_fn(|_| QueueWiring::empty())),
            interrupts: RwLock::new(None),
            device_lost: RwLock::new(None),
            state: StateCell::new(),
            max_batch_size: config.max_batch_size.max(1),
            submitted_payloads: AtomicU64::new(0),
            submitted_batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        });
        Self {
            shared,
            worker: Mutex::new(Worker::idle(THREAD_NAME)),
            config,
        }
    }

    // ── Wiring ──────────────────────────────────────────────

    pub fn set_queue(&self, queue: QueueType, hardware: Arc<dyn HardwareQueue<B::CommandList>>) {
        self.shared.wiring.lock()[queue].hardware = Some(hardware);
    }

    /// Wire the fence of `queue`. Values handed out afterwards continue from
    /// the fence's current completed value. Wiring the same fence again never
    /// moves the counter backwards.
    pub fn set_queue_fence(&self, queue: QueueType, fence: Arc<dyn Fence>) {
        let completed = fence.completed_value();
        let mut wiring = self.shared.wiring.lock();
        let slot = &mut wiring[queue];
        let rewired = slot.fence.as_ref().is_some_and(|current| same_fence(current, &fence));
        slot.last_value = if rewired {
            slot.last_value.max(completed)
        } else {
            completed
        };
        slot.fence = Some(fence);
        debug!(queue = %queue, completed, last_value = slot.last_value, rewired, "queue fence wired");
    }

    /// Pool that takes back command lists once they have been submitted.
    pub fn set_object_pool(&self, queue: QueueType, pool: Arc<ObjectPool<B>>) {
        self.shared.wiring.lock()[queue].pool = Some(pool);
    }

    pub fn set_interrupt_sender(&self, sender: InterruptSender<B>) {
        *self.shared.interrupts.write() = Some(sender);
    }

    pub fn attach_device_lost_handler(&self, handler: Arc<DeviceLostHandler>) {
        *self.shared.device_lost.write() = Some(handler);
    }

    // ── Producer side ───────────────────────────────────────

    /// Stamp `payload` with the next fence value of its queue and queue it for
    /// submission. The returned sync point completes once the payload has
    /// executed.
    pub fn enqueue_payload(&self, mut payload: Payload<B>) -> Result<SyncPoint, RhiError> {
        let queue = payload.queue_type();
        self.shared.queue.try_push_with(|| {
            let mut wiring = self.shared.wiring.lock();
            let slot = &mut wiring[queue];
            let fence = match (&slot.hardware, &slot.fence) {
                (Some(_), Some(fence)) => Arc::clone(fence),
                _ => return Err(RhiError::QueueNotWired(queue)),
            };
            slot.last_value += 1;
            payload.stamp(slot.last_value);
            let sync = SyncPoint::new(fence, slot.last_value);
            Ok((payload, sync))
        })
    }

    /// Last fence value assigned on `queue`.
    pub fn last_fence_value(&self, queue: QueueType) -> u64 {
        self.shared.wiring.lock()[queue].last_value
    }

    // ── Lifecycle ───────────────────────────────────────────

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

        self.shared.queue.reopen();
        self.shared.state.store(ThreadState::Running);

        let shared = Arc::clone(&self.shared);
        if let Err(e) = worker.spawn(move || run(&*shared)) {
            self.shared.state.store(ThreadState::Stopped);
            return Err(e);
        }
        info!(max_batch_size = self.shared.max_batch_size, "submission thread started");
        Ok(())
    }

    /// Submit everything already queued, then stop. On timeout the thread is
    /// left draining and a later `stop` may retry.
    pub fn stop(&self, timeout: Duration) -> Result<(), RhiError> {
        let mut worker = self.worker.lock();
        if !worker.is_alive() {
            return Ok(());
        }

        self.shared.state.store(ThreadState::Draining);
        self.shared.queue.close();

        if !worker.join_timeout(timeout) {
            error!(
                thread = THREAD_NAME,
                timeout_ms = timeout.as_millis() as u64,
                queued = self.shared.queue.len(),
                "submission thread did not drain in time"
            );
            return Err(RhiError::ShutdownTimeout {
                thread: THREAD_NAME,
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        self.shared.state.store(ThreadState::Stopped);
        info!(
            payloads = self.submitted_payload_count(),
            batches = self.submitted_batch_count(),
            failed = self.failed_batch_count(),
            "submission thread stopped"
        );
        Ok(())
    }

    /// Stop with the configured timeout.
    pub fn shutdown(&self) -> Result<(), RhiError> {
        self.stop(self.config.stop_timeout())
    }

    // ── Queries ─────────────────────────────────────────────

    pub fn state(&self) -> ThreadState {
        self.shared.state.load()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn submitted_payload_count(&self) -> u64 {
        self.shared.submitted_payloads.load(Ordering::Relaxed)
    }

    pub fn submitted_batch_count(&self) -> u64 {
        self.shared.submitted_batches.load(Ordering::Relaxed)
    }

    pub fn failed_batch_count(&self) -> u64 {
        self.shared.failed_batches.load(Ordering::Relaxed)
    }
}

impl<B: Backend> Drop for SubmissionThread<B> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// ── Worker loop ─────────────────────────────────────────────

fn run<B: Backend>(shared: &SubmissionShared<B>) {
    loop {
        let batch = shared
            .queue
            .wait_pop_batch(shared.max_batch_size, |first, next| first.queue_type() == next.queue_type());
        if batch.is_empty() {
            break;
        }
        shared.submit_batch(batch);
    }
    debug!("submission thread exiting");
}

impl<B: Backend> SubmissionShared<B> {
    fn submit_batch(&self, batch: Vec<Payload<B>>) {
        let queue = batch[0].queue_type();
        let mut parts: Vec<PayloadParts<B>> = batch.into_iter().map(Payload::into_parts).collect();
        let signal_value = parts.iter().map(|p| p.fence_value).max().unwrap_or_default();

        let (hardware, fence, pool) = {
            let wiring = self.wiring.lock();
            let slot = &wiring[queue];
            (slot.hardware.clone(), slot.fence.clone(), slot.pool.clone())
        };
        let Some(fence) = fence else {
            // Only reachable if the queue was unwired after enqueue.
            error!(queue = %queue, payloads = parts.len(), "queue fence missing at submit; dropping batch");
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut lists = Vec::new();
        for p in parts.iter_mut() {
            lists.append(&mut p.command_lists);
        }

        let result = match &hardware {
            Some(hw) if lists.is_empty() => hw.signal(&*fence, signal_value),
            Some(hw) => hw.submit(&lists, &*fence, signal_value),
            None => Err(RhiError::QueueNotWired(queue)),
        };

        let succeeded = match result {
            Ok(()) => {
                debug!(
                    queue = %queue,
                    payloads = parts.len(),
                    command_lists = lists.len(),
                    signal_value,
                    "batch submitted"
                );
                self.submitted_batches.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                error!(
                    queue = %queue,
                    payloads = parts.len(),
                    signal_value,
                    "submit failed: {}",
                    e
                );
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.report(&e);
                false
            }
        };

        match &pool {
            Some(pool) => pool.release_command_lists(lists),
            None => drop(lists),
        }

        self.submitted_payloads.fetch_add(parts.len() as u64, Ordering::Relaxed);
        if succeeded {
            self.forward(queue, &fence, parts, pool.as_ref());
        } else {
            self.park_failed(queue, &fence, parts, pool.as_ref());
        }
    }

    /// Nothing will signal the values of a failed batch, so its allocators
    /// skip the interrupt thread and wait in the pool until later work on
    /// the same queue moves the fence past them.
    fn park_failed(
        &self,
        queue: QueueType,
        fence: &Arc<dyn Fence>,
        parts: Vec<PayloadParts<B>>,
        pool: Option<&Arc<ObjectPool<B>>>,
    ) {
        for p in parts {
            if p.on_complete.is_some() {
                warn!(queue = %queue, fence_value = p.fence_value, "dropping completion callback of failed submit");
            }
            match pool {
                Some(pool) => {
                    for allocator in p.allocators {
                        pool.release_command_allocator(allocator, Arc::clone(fence), p.fence_value);
                    }
                }
                None if !p.allocators.is_empty() => {
                    warn!(queue = %queue, fence_value = p.fence_value, "no pool wired; dropping allocators of failed submit");
                }
                None => {}
            }
        }
    }

    /// Hand one completion wait per payload to the interrupt thread, in order.
    fn forward(
        &self,
        queue: QueueType,
        fence: &Arc<dyn Fence>,
        parts: Vec<PayloadParts<B>>,
        pool: Option<&Arc<ObjectPool<B>>>,
    ) {
        let interrupts = self.interrupts.read().clone();
        for p in parts {
            let mut entry = PendingInterrupt::new(queue, Arc::clone(fence), p.fence_value, p.allocators);
            entry.callback = p.on_complete;

            match (&interrupts, pool) {
                (Some(sender), _) => sender.send(entry),
                // No interrupt thread: keep the allocators gated in the pool.
                (None, Some(pool)) => {
                    for allocator in entry.allocators {
                        pool.release_command_allocator(allocator, Arc::clone(fence), entry.fence_value);
                    }
                }
                (None, None) if !entry.allocators.is_empty() => {
                    warn!(queue = %queue, fence_value = entry.fence_value, "no interrupt thread or pool wired; dropping allocators");
                }
                (None, None) => {}
            }
        }
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

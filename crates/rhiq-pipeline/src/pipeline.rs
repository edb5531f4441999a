use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use rhiq_core::{Backend, Fence, HardwareQueue, ObjectPool, Payload, PerQueue, PipelineConfig, QueueType, RhiError, SyncPoint};
use rhiq_device::DeviceLostHandler;

use crate::interrupt::InterruptThread;
use crate::submission::SubmissionThread;

/// One object pool per queue type plus the submission and interrupt threads,
/// wired together.
pub struct SubmissionPipeline<B: Backend> {
    backend: Arc<B>,
    config: PipelineConfig,
    pools: PerQueue<Arc<ObjectPool<B>>>,
    submission: SubmissionThread<B>,
    interrupt: InterruptThread<B>,
    device_lost: Mutex<Option<Arc<DeviceLostHandler>>>,
}

impl<B: Backend> SubmissionPipeline<B> {
    pub fn new(backend: Arc<B>, config: PipelineConfig) -> Self {
        let pools = PerQueue::from_fn(|queue| Arc::new(ObjectPool::new(queue, Arc::clone(&backend))));
        let submission = SubmissionThread::new(config.submission.clone());
        let interrupt = InterruptThread::new(config.interrupt.clone());

        for (queue, pool) in pools.iter() {
            submission.set_object_pool(queue, Arc::clone(pool));
            interrupt.set_object_pool(queue, Arc::clone(pool));
        }
        submission.set_interrupt_sender(interrupt.sender());

        Self {
            backend,
            config,
            pools,
            submission,
            interrupt,
            device_lost: Mutex::new(None),
        }
    }

    /// Wire the hardware queue and its fence for `queue`.
    pub fn set_queue(
        &self,
        queue: QueueType,
        hardware: Arc<dyn HardwareQueue<B::CommandList>>,
        fence: Arc<dyn Fence>,
    ) {
        self.submission.set_queue(queue, hardware);
        self.set_queue_fence(queue, fence);
    }

    pub fn set_queue_fence(&self, queue: QueueType, fence: Arc<dyn Fence>) {
        self.submission.set_queue_fence(queue, fence);
    }

    /// Report device losses the worker threads run into to `handler`.
    pub fn attach_device_lost_handler(&self, handler: Arc<DeviceLostHandler>) {
        self.submission.attach_device_lost_handler(Arc::clone(&handler));
        self.interrupt.attach_device_lost_handler(Arc::clone(&handler));
        *self.device_lost.lock() = Some(handler);
    }

    pub fn device_lost_handler(&self) -> Option<Arc<DeviceLostHandler>> {
        self.device_lost.lock().clone()
    }

    /// Start the interrupt thread, then the submission thread.
    pub fn start(&self) -> Result<(), RhiError> {
        self.interrupt.start()?;
        if let Err(e) = self.submission.start() {
            let _ = self.interrupt.shutdown();
            return Err(e);
        }
        info!("submission pipeline started");
        Ok(())
    }

    /// Stop the submission thread, then the interrupt thread, then empty every
    /// pool. Pools are left alone if either thread fails to stop.
    pub fn stop(&self) -> Result<(), RhiError> {
        self.submission.shutdown()?;
        self.interrupt.shutdown()?;

        let released: usize = self.pools.iter().map(|(_, pool)| pool.release_all()).sum();
        info!(released, "submission pipeline stopped");
        Ok(())
    }

    pub fn enqueue_payload(&self, payload: Payload<B>) -> Result<SyncPoint, RhiError> {
        self.submission.enqueue_payload(payload)
    }

    pub fn pool(&self, queue: QueueType) -> &Arc<ObjectPool<B>> {
        &self.pools[queue]
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn submission(&self) -> &SubmissionThread<B> {
        &self.submission
    }

    pub fn interrupt(&self) -> &InterruptThread<B> {
        &self.interrupt
    }
}

impl<B: Backend> Drop for SubmissionPipeline<B> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("submission pipeline did not stop cleanly: {}", e);
        }
    }
}

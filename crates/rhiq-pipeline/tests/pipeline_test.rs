//! Integration test: submission pipeline over the simulated backend
//!
//! Covers fence stamping, batching, per-queue ordering, allocator recycling,
//! failure handling and shutdown.
//!
//! Run with: cargo test -p rhiq-pipeline --test pipeline_test -- --nocapture

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rhiq_core::sim::{Completion, SimBackend, SimCommandList, SimFence, SimQueue};
use rhiq_core::{Fence, HardwareQueue, Payload, PipelineConfig, QueueType, RhiError};
use rhiq_device::{DeviceLostHandler, NeverLost};
use rhiq_pipeline::{SubmissionPipeline, SubmissionThread, ThreadState};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.interrupt.wait_slice_ms = 10;
    config.submission.stop_timeout_ms = 2_000;
    config.interrupt.stop_timeout_ms = 2_000;
    config
}

struct Harness {
    pipeline: SubmissionPipeline<SimBackend>,
    queue: Arc<SimQueue>,
    fence: Arc<SimFence>,
}

fn make_harness(completion: Completion, config: PipelineConfig) -> Harness {
    rhiq_common::try_init_test_logging();
    let pipeline = SubmissionPipeline::new(Arc::new(SimBackend::new()), config);
    let fence = Arc::new(SimFence::new("graphics", 0));
    let queue = Arc::new(SimQueue::new(QueueType::Graphics, fence.clone(), completion));
    pipeline.set_queue(QueueType::Graphics, queue.clone(), fence.clone());
    Harness { pipeline, queue, fence }
}

/// Record one command list into a fresh allocator from the queue's pool.
fn record(pipeline: &SubmissionPipeline<SimBackend>, queue: QueueType) -> Payload<SimBackend> {
    let pool = pipeline.pool(queue);
    let allocator = pool.obtain_command_allocator();
    let list = pool.obtain_command_list(&allocator);
    Payload::new(queue, vec![list], vec![allocator]).unwrap()
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_fence_values_continue_from_completed() {
    rhiq_common::try_init_test_logging();
    let pipeline = SubmissionPipeline::new(Arc::new(SimBackend::new()), test_config());
    let fence = Arc::new(SimFence::new("graphics", 7));
    let queue = Arc::new(SimQueue::new(QueueType::Graphics, fence.clone(), Completion::Manual));
    pipeline.set_queue(QueueType::Graphics, queue, fence);

    let values: Vec<u64> = (0..3)
        .map(|_| pipeline.enqueue_payload(record(&pipeline, QueueType::Graphics)).unwrap().value)
        .collect();
    assert_eq!(values, vec![8, 9, 10]);
    assert_eq!(pipeline.submission().last_fence_value(QueueType::Graphics), 10);
    assert_eq!(pipeline.submission().queue_depth(), 3);
}

#[test]
fn test_enqueue_on_unwired_queue_fails() {
    let h = make_harness(Completion::Immediate, test_config());
    let err = h
        .pipeline
        .enqueue_payload(record(&h.pipeline, QueueType::Compute))
        .unwrap_err();
    assert!(matches!(err, RhiError::QueueNotWired(QueueType::Compute)));
}

#[test]
fn test_payloads_complete_and_recycle() {
    let h = make_harness(Completion::Immediate, test_config());
    h.pipeline.start().unwrap();
    assert_eq!(h.pipeline.submission().state(), ThreadState::Running);
    assert_eq!(h.pipeline.interrupt().state(), ThreadState::Running);

    // Record everything up front so no object is recycled mid-test.
    let payloads: Vec<_> = (0..10).map(|_| record(&h.pipeline, QueueType::Graphics)).collect();

    let completed = Arc::new(Mutex::new(Vec::new()));
    let mut last = None;
    for (value, payload) in (1u64..).zip(payloads) {
        let completed = completed.clone();
        let sync = h
            .pipeline
            .enqueue_payload(payload.with_completion(move || completed.lock().unwrap().push(value)))
            .unwrap();
        assert_eq!(sync.value, value);
        last = Some(sync);
    }

    assert!(last.unwrap().wait(WAIT).unwrap());
    wait_for("interrupts", || h.pipeline.interrupt().processed_count() == 10);

    assert_eq!(*completed.lock().unwrap(), (1..=10).collect::<Vec<u64>>());
    let pool = h.pipeline.pool(QueueType::Graphics);
    assert_eq!(pool.available_count(), 10);
    assert_eq!(pool.pending_count(), 0);
    assert_eq!(pool.free_command_list_count(), 10);
    assert_eq!(h.pipeline.submission().submitted_payload_count(), 10);

    h.pipeline.stop().unwrap();
    assert_eq!(h.pipeline.submission().state(), ThreadState::Stopped);
    assert_eq!(h.pipeline.interrupt().state(), ThreadState::Stopped);
    assert_eq!(pool.available_count(), 0, "stop empties the pools");
}

#[test]
fn test_release_order_follows_fence_order() {
    let h = make_harness(Completion::Manual, test_config());
    h.pipeline.start().unwrap();

    let pool = Arc::clone(h.pipeline.pool(QueueType::Graphics));
    let seen = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        let seen = seen.clone();
        let pool = pool.clone();
        let payload = record(&h.pipeline, QueueType::Graphics)
            .with_completion(move || seen.lock().unwrap().push((tag, pool.available_count())));
        h.pipeline.enqueue_payload(payload).unwrap();
    }
    wait_for("both submits", || h.pipeline.submission().submitted_payload_count() == 2);

    // Completing both at once must still release the first payload first.
    h.fence.signal(2);
    wait_for("interrupts", || h.pipeline.interrupt().processed_count() == 2);

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].0, "first");
    assert_eq!(seen[1].0, "second");
    assert!(seen[0].1 >= 1, "allocators are released before the callback runs");
    assert_eq!(seen[1].1, 2);
}

#[test]
fn test_allocator_not_reused_before_fence() {
    let h = make_harness(Completion::Manual, test_config());
    h.pipeline.start().unwrap();

    let pool = h.pipeline.pool(QueueType::Graphics);
    let payload = record(&h.pipeline, QueueType::Graphics);
    h.pipeline.enqueue_payload(payload).unwrap();
    wait_for("submit", || h.pipeline.submission().submitted_payload_count() == 1);

    let submitted_list = h.queue.records()[0].command_list_ids[0];
    let fresh = pool.obtain_command_allocator();
    assert_eq!(pool.stats().created_allocators, 2, "in-flight allocator must not be handed out");

    h.fence.signal(1);
    wait_for("interrupt", || h.pipeline.interrupt().processed_count() == 1);
    assert_eq!(pool.available_count(), 1);

    let recycled = pool.obtain_command_allocator();
    assert_ne!(recycled.id, fresh.id);
    assert_eq!(recycled.resets, 1);
    // Submitted lists were reusable right away.
    assert_eq!(pool.obtain_command_list(&recycled).id, submitted_list);
}

#[test]
fn test_batching_coalesces_same_queue() {
    let h = make_harness(Completion::Manual, test_config());
    for _ in 0..5 {
        h.pipeline.enqueue_payload(record(&h.pipeline, QueueType::Graphics)).unwrap();
    }

    h.pipeline.start().unwrap();
    wait_for("submits", || h.pipeline.submission().submitted_payload_count() == 5);

    let records = h.queue.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].command_list_ids.len(), 5);
    assert_eq!(records[0].signal_value, 5);
    assert_eq!(h.pipeline.submission().submitted_batch_count(), 1);
}

#[test]
fn test_batching_respects_max_batch_size() {
    let mut config = test_config();
    config.submission.max_batch_size = 2;
    let h = make_harness(Completion::Manual, config);
    for _ in 0..5 {
        h.pipeline.enqueue_payload(record(&h.pipeline, QueueType::Graphics)).unwrap();
    }

    h.pipeline.start().unwrap();
    wait_for("submits", || h.pipeline.submission().submitted_payload_count() == 5);

    let signals: Vec<u64> = h.queue.records().iter().map(|r| r.signal_value).collect();
    assert_eq!(signals, vec![2, 4, 5]);
}

#[test]
fn test_batch_splits_on_queue_change() {
    let h = make_harness(Completion::Manual, test_config());
    let compute_fence = Arc::new(SimFence::new("compute", 0));
    let compute = Arc::new(SimQueue::new(QueueType::Compute, compute_fence.clone(), Completion::Manual));
    h.pipeline.set_queue(QueueType::Compute, compute.clone(), compute_fence);

    for queue in [QueueType::Graphics, QueueType::Graphics, QueueType::Compute, QueueType::Graphics] {
        h.pipeline.enqueue_payload(record(&h.pipeline, queue)).unwrap();
    }

    h.pipeline.start().unwrap();
    wait_for("submits", || h.pipeline.submission().submitted_payload_count() == 4);

    let graphics: Vec<u64> = h.queue.records().iter().map(|r| r.signal_value).collect();
    assert_eq!(graphics, vec![2, 3]);
    let compute: Vec<u64> = compute.records().iter().map(|r| r.signal_value).collect();
    assert_eq!(compute, vec![1]);
}

#[test]
fn test_signal_only_payload_advances_fence() {
    let h = make_harness(Completion::Immediate, test_config());
    h.pipeline.start().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let payload = {
        let ran = ran.clone();
        Payload::signal_only(QueueType::Graphics).with_completion(move || ran.store(true, Ordering::SeqCst))
    };
    let sync = h.pipeline.enqueue_payload(payload).unwrap();

    assert!(sync.wait(WAIT).unwrap());
    wait_for("callback", || ran.load(Ordering::SeqCst));
    assert_eq!(h.queue.submit_count(), 0, "nothing to execute on hardware");
    assert_eq!(h.fence.completed_value(), 1);
}

#[test]
fn test_submit_failure_keeps_allocators_gated() {
    let h = make_harness(Completion::Immediate, test_config());
    h.queue.fail_next_submits(1);
    h.pipeline.start().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let payload = {
        let ran = ran.clone();
        record(&h.pipeline, QueueType::Graphics).with_completion(move || ran.store(true, Ordering::SeqCst))
    };
    h.pipeline.enqueue_payload(payload).unwrap();
    let pool = h.pipeline.pool(QueueType::Graphics);
    wait_for("parked allocator", || pool.pending_count() == 1);

    assert_eq!(h.pipeline.submission().failed_batch_count(), 1);
    assert_eq!(pool.available_count(), 0);
    assert_eq!(pool.free_command_list_count(), 1, "lists come back even when submit fails");
    assert_eq!(h.pipeline.interrupt().queue_depth(), 0);
    assert_eq!(h.pipeline.interrupt().processed_count(), 0);

    // Later work on the same queue moves the fence past the failed value.
    let sync = h
        .pipeline
        .enqueue_payload(record(&h.pipeline, QueueType::Graphics))
        .unwrap();
    assert_eq!(sync.value, 2);
    assert!(sync.wait(WAIT).unwrap());
    wait_for("interrupt", || h.pipeline.interrupt().processed_count() == 1);

    assert_eq!(pool.pending_count(), 0);
    assert_eq!(pool.available_count(), 2);
    assert!(!ran.load(Ordering::SeqCst), "callback of a failed submit never runs");
}

#[test]
fn test_failed_submit_does_not_stall_other_queues() {
    let h = make_harness(Completion::Immediate, test_config());
    let compute_fence = Arc::new(SimFence::new("compute", 0));
    let compute = Arc::new(SimQueue::new(QueueType::Compute, compute_fence.clone(), Completion::Immediate));
    h.pipeline.set_queue(QueueType::Compute, compute, compute_fence.clone());
    h.queue.fail_next_submits(1);
    h.pipeline.start().unwrap();

    h.pipeline.enqueue_payload(record(&h.pipeline, QueueType::Graphics)).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let payload = {
        let ran = ran.clone();
        record(&h.pipeline, QueueType::Compute).with_completion(move || ran.store(true, Ordering::SeqCst))
    };
    let sync = h.pipeline.enqueue_payload(payload).unwrap();

    assert!(sync.wait(WAIT).unwrap());
    wait_for("compute callback", || ran.load(Ordering::SeqCst));

    let compute_pool = h.pipeline.pool(QueueType::Compute);
    assert_eq!(compute_pool.available_count(), 1);
    assert_eq!(compute_pool.pending_count(), 0);

    let graphics_pool = h.pipeline.pool(QueueType::Graphics);
    assert_eq!(h.pipeline.submission().failed_batch_count(), 1);
    assert_eq!(h.fence.completed_value(), 0);
    assert_eq!(graphics_pool.pending_count(), 1);
    assert_eq!(graphics_pool.available_count(), 0);
    assert_eq!(h.pipeline.interrupt().queue_depth(), 0);
}

#[test]
fn test_rewiring_same_fence_keeps_counter() {
    let h = make_harness(Completion::Manual, test_config());
    for _ in 0..3 {
        h.pipeline.enqueue_payload(record(&h.pipeline, QueueType::Graphics)).unwrap();
    }
    h.fence.signal(1);

    h.pipeline.set_queue_fence(QueueType::Graphics, h.fence.clone());
    assert_eq!(h.pipeline.submission().last_fence_value(QueueType::Graphics), 3);
    let sync = h
        .pipeline
        .enqueue_payload(record(&h.pipeline, QueueType::Graphics))
        .unwrap();
    assert_eq!(sync.value, 4);

    // A different fence starts from its own completed value.
    let other = Arc::new(SimFence::new("graphics-2", 20));
    h.pipeline.set_queue_fence(QueueType::Graphics, other);
    assert_eq!(h.pipeline.submission().last_fence_value(QueueType::Graphics), 20);
}

#[test]
fn test_device_loss_is_reported_by_workers() {
    let h = make_harness(Completion::Immediate, test_config());
    let handler = Arc::new(DeviceLostHandler::new());
    handler.initialize(Arc::new(NeverLost));
    let notified = Arc::new(AtomicUsize::new(0));
    {
        let notified = notified.clone();
        handler.add_callback(move |_| {
            notified.fetch_add(1, Ordering::SeqCst);
        });
    }
    h.pipeline.attach_device_lost_handler(handler.clone());
    h.pipeline.start().unwrap();

    h.queue.lose_device();
    h.pipeline.enqueue_payload(record(&h.pipeline, QueueType::Graphics)).unwrap();

    wait_for("device lost", || handler.is_lost());
    wait_for("parked allocator", || h.pipeline.pool(QueueType::Graphics).pending_count() == 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(h.pipeline.interrupt().abandoned_count(), 0, "nothing was handed to the interrupt thread");
}

#[test]
fn test_stop_is_idempotent() {
    let h = make_harness(Completion::Immediate, test_config());
    h.pipeline.stop().unwrap();

    h.pipeline.start().unwrap();
    h.pipeline.start().unwrap();
    h.pipeline.stop().unwrap();
    h.pipeline.stop().unwrap();
    assert_eq!(h.pipeline.submission().state(), ThreadState::Stopped);

    // Restart after a clean stop.
    h.pipeline.start().unwrap();
    let sync = h.pipeline.enqueue_payload(record(&h.pipeline, QueueType::Graphics)).unwrap();
    assert!(sync.wait(WAIT).unwrap());
    wait_for("interrupt", || h.pipeline.interrupt().processed_count() == 1);
    h.pipeline.stop().unwrap();
}

#[test]
fn test_stop_drains_queued_payloads() {
    let h = make_harness(Completion::Delayed(Duration::from_millis(2)), test_config());
    h.pipeline.start().unwrap();
    let mut syncs = Vec::new();
    for _ in 0..20 {
        syncs.push(h.pipeline.enqueue_payload(record(&h.pipeline, QueueType::Graphics)).unwrap());
    }

    let pool = Arc::clone(h.pipeline.pool(QueueType::Graphics));
    h.pipeline.submission().shutdown().unwrap();
    h.pipeline.interrupt().shutdown().unwrap();

    assert_eq!(h.pipeline.submission().submitted_payload_count(), 20);
    assert_eq!(h.pipeline.interrupt().processed_count(), 20);
    assert!(syncs.iter().all(|s| s.is_completed()));
    assert_eq!(pool.pending_count(), 0);
    assert_eq!(pool.available_count(), pool.stats().created_allocators);
}

#[test]
fn test_concurrent_producers_get_ordered_values() {
    let h = make_harness(Completion::Delayed(Duration::from_micros(200)), test_config());
    h.pipeline.start().unwrap();
    let pipeline = Arc::new(h.pipeline);

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                (0..50)
                    .map(|_| {
                        pipeline
                            .enqueue_payload(record(&pipeline, QueueType::Graphics))
                            .unwrap()
                            .value
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut all = HashSet::new();
    for producer in producers {
        let values = producer.join().unwrap();
        assert!(values.windows(2).all(|w| w[0] < w[1]), "per-producer values must increase");
        all.extend(values);
    }
    assert_eq!(all.len(), 200);
    assert_eq!(all.iter().max().copied(), Some(200));

    wait_for("interrupts", || pipeline.interrupt().processed_count() == 200);
    let signals: Vec<u64> = h.queue.records().iter().map(|r| r.signal_value).collect();
    assert!(signals.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(signals.last().copied(), Some(200));
    assert_eq!(h.fence.completed_value(), 200);
    pipeline.stop().unwrap();
}

// ── Hung hardware queue ─────────────────────────────────────

/// Blocks inside every submit until the test lets it go.
struct HungQueue {
    entered: crossbeam_channel::Sender<()>,
    release: crossbeam_channel::Receiver<()>,
}

impl HardwareQueue<SimCommandList> for HungQueue {
    fn submit(&self, _lists: &[SimCommandList], _fence: &dyn Fence, _value: u64) -> Result<(), RhiError> {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        Ok(())
    }

    fn signal(&self, fence: &dyn Fence, value: u64) -> Result<(), RhiError> {
        self.submit(&[], fence, value)
    }
}

#[test]
fn test_stop_times_out_on_hung_submit() {
    rhiq_common::try_init_test_logging();
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    let fence = Arc::new(SimFence::new("graphics", 0));

    let submission: SubmissionThread<SimBackend> = SubmissionThread::new(test_config().submission);
    submission.set_queue(
        QueueType::Graphics,
        Arc::new(HungQueue {
            entered: entered_tx,
            release: release_rx,
        }),
    );
    submission.set_queue_fence(QueueType::Graphics, fence);
    submission.start().unwrap();

    submission.enqueue_payload(Payload::signal_only(QueueType::Graphics)).unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    let err = submission.stop(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, RhiError::ShutdownTimeout { thread: "rhiq-submission", .. }));
    assert_eq!(submission.state(), ThreadState::Draining);

    release_tx.send(()).unwrap();
    submission.stop(WAIT).unwrap();
    assert_eq!(submission.state(), ThreadState::Stopped);
    assert_eq!(submission.submitted_payload_count(), 1);
}

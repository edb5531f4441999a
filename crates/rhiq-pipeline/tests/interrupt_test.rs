//! Integration test: InterruptThread
//!
//! Run with: cargo test -p rhiq-pipeline --test interrupt_test -- --nocapture

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rhiq_core::config::InterruptConfig;
use rhiq_core::sim::{SimBackend, SimFence};
use rhiq_core::{ObjectPool, PendingInterrupt, QueueType};
use rhiq_pipeline::{InterruptThread, ThreadState};

fn make_interrupt_thread() -> (InterruptThread<SimBackend>, Arc<ObjectPool<SimBackend>>) {
    rhiq_common::try_init_test_logging();
    let config = InterruptConfig {
        wait_slice_ms: 10,
        ..InterruptConfig::default()
    };
    let interrupt = InterruptThread::new(config);
    let pool = Arc::new(ObjectPool::new(QueueType::Graphics, Arc::new(SimBackend::new())));
    interrupt.set_object_pool(QueueType::Graphics, pool.clone());
    (interrupt, pool)
}

fn entry(
    pool: &ObjectPool<SimBackend>,
    fence: &Arc<SimFence>,
    value: u64,
) -> PendingInterrupt<SimBackend> {
    let fence: Arc<dyn rhiq_core::Fence> = fence.clone();
    PendingInterrupt::new(QueueType::Graphics, fence, value, vec![pool.obtain_command_allocator()])
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_one_readback_releases_many_entries() {
    let (interrupt, pool) = make_interrupt_thread();
    let fence = Arc::new(SimFence::new("graphics", 9));

    for value in [10, 11, 12] {
        interrupt.enqueue_interrupt(entry(&pool, &fence, value));
    }
    assert_eq!(interrupt.queue_depth(), 3);
    assert_eq!(pool.available_count(), 0);

    // Jump straight past all three before the thread looks.
    fence.signal(12);
    interrupt.start().unwrap();
    wait_for("interrupts", || interrupt.processed_count() == 3);

    assert_eq!(pool.available_count(), 3);
    assert_eq!(pool.pending_count(), 0);
    assert_eq!(fence.wait_calls(), 0, "no entry should block on the fence");
    interrupt.stop(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_waits_until_fence_advances() {
    let (interrupt, pool) = make_interrupt_thread();
    let fence = Arc::new(SimFence::new("graphics", 0));
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = ran.clone();
        interrupt.enqueue_interrupt(entry(&pool, &fence, 1).with_callback(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }
    interrupt.start().unwrap();

    thread::sleep(Duration::from_millis(30));
    assert_eq!(interrupt.processed_count(), 0);
    assert_eq!(pool.available_count(), 0);

    fence.signal(1);
    wait_for("interrupt", || interrupt.processed_count() == 1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(pool.available_count(), 1);
}

#[test]
fn test_stop_abandons_unfinished_entries() {
    let (interrupt, pool) = make_interrupt_thread();
    let fence = Arc::new(SimFence::new("graphics", 0));
    let ran = Arc::new(AtomicUsize::new(0));
    for value in [1, 2] {
        let ran = ran.clone();
        interrupt.enqueue_interrupt(entry(&pool, &fence, value).with_callback(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }
    interrupt.start().unwrap();

    interrupt.stop(Duration::from_millis(100)).unwrap();
    assert_eq!(interrupt.state(), ThreadState::Stopped);
    assert_eq!(interrupt.abandoned_count(), 2);
    assert_eq!(ran.load(Ordering::SeqCst), 0, "callbacks of abandoned entries never run");

    // Still gated by their fence.
    assert_eq!(pool.pending_count(), 2);
    assert_eq!(pool.available_count(), 0);
    fence.signal(2);
    assert_eq!(pool.trim(), 2);
}

#[test]
fn test_panicking_callback_keeps_thread_alive() {
    let (interrupt, pool) = make_interrupt_thread();
    let fence = Arc::new(SimFence::new("graphics", 0));
    interrupt.enqueue_interrupt(entry(&pool, &fence, 1).with_callback(|| panic!("user callback failed")));
    interrupt.enqueue_interrupt(entry(&pool, &fence, 2));

    interrupt.start().unwrap();
    fence.signal(2);
    wait_for("interrupts", || interrupt.processed_count() == 2);
    assert_eq!(interrupt.state(), ThreadState::Running);
    assert_eq!(pool.available_count(), 2);
}

#[test]
fn test_lost_fence_abandons_entry() {
    let (interrupt, pool) = make_interrupt_thread();
    let fence = Arc::new(SimFence::new("graphics", 0));
    interrupt.enqueue_interrupt(entry(&pool, &fence, 1));
    interrupt.start().unwrap();

    fence.lose_device();
    wait_for("abandoned", || interrupt.abandoned_count() == 1);
    assert_eq!(pool.pending_count(), 1);
    assert_eq!(interrupt.processed_count(), 0);
}

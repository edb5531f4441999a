//! `rhiq soak`: concurrent producers against the simulated backend, with an
//! optional injected device loss followed by recovery.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use rhiq_core::sim::{Completion, SimBackend, SimFence, SimQueue};
use rhiq_core::{Fence, Payload, PipelineConfig, PoolStats, QueueType, RecoveryOptions, RhiError};
use rhiq_device::{
    DeviceLossProbe, DeviceLostHandler, DeviceLostInfo, DeviceLostReason, DeviceRecoveryManager, DeviceRecreator,
};
use rhiq_pipeline::SubmissionPipeline;

/// Share of payloads that carry no command lists.
const SIGNAL_ONLY_RATIO: f64 = 0.05;

/// Period of the frame loop that ticks device-loss polling and logs stats.
const FRAME: Duration = Duration::from_millis(10);

pub struct SoakOptions {
    pub duration: Duration,
    pub producers: usize,
    pub latency: Duration,
    pub jitter: Duration,
    pub max_lists: usize,
    pub lose_device_after: Option<Duration>,
    pub failed_recreations: u32,
}

pub struct SoakReport {
    pub elapsed: Duration,
    pub enqueued: u64,
    pub completed: u64,
    pub submitted: u64,
    pub batches: u64,
    pub processed: u64,
    pub abandoned: u64,
    pub pools: Vec<PoolStats>,
    pub device_lost: Option<DeviceLostInfo>,
    pub recovery: Option<RecoveryOutcome>,
}

pub struct RecoveryOutcome {
    pub recovered: bool,
    pub attempts: u32,
    pub generation: Option<u32>,
    pub resources_recreated: u64,
}

// ── Simulated device ────────────────────────────────────────

struct SimDevice {
    generation: u32,
}

/// Fails a fixed number of recreations, then hands out numbered devices.
struct SimRecreator {
    failures_left: AtomicU32,
    generation: AtomicU32,
}

impl DeviceRecreator<SimDevice> for SimRecreator {
    fn recreate_device(&self, options: &RecoveryOptions) -> Result<Arc<SimDevice>, RhiError> {
        debug!(
            prefer_same_adapter = options.prefer_same_adapter,
            timeout_ms = options.timeout_ms,
            "recreating simulated device"
        );
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(RhiError::Backend("simulated adapter not ready".to_string()));
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(SimDevice { generation }))
    }
}

/// Loss detection for the simulated queues: lost once any fence is poisoned.
struct SimLossProbe {
    fences: Vec<Arc<SimFence>>,
}

impl DeviceLossProbe for SimLossProbe {
    fn check(&self) -> Option<DeviceLostInfo> {
        self.fences.iter().find(|f| f.is_lost()).map(|f| {
            DeviceLostInfo::new(DeviceLostReason::Hung, format!("{} stopped advancing", f.debug_name()))
        })
    }
}

// ── Run ─────────────────────────────────────────────────────

pub fn run_soak(config: PipelineConfig, options: SoakOptions) -> anyhow::Result<SoakReport> {
    let pipeline = Arc::new(SubmissionPipeline::new(Arc::new(SimBackend::new()), config.clone()));

    let mut queues = Vec::new();
    for queue_type in QueueType::ALL {
        let fence = Arc::new(SimFence::new(queue_type.name(), 0));
        let queue = Arc::new(SimQueue::new(
            queue_type,
            Arc::clone(&fence),
            Completion::Delayed(options.latency),
        ));
        pipeline.set_queue(queue_type, queue.clone(), fence.clone());
        queues.push((queue, fence));
    }

    let handler = Arc::new(DeviceLostHandler::new());
    handler.initialize(Arc::new(SimLossProbe {
        fences: queues.iter().map(|(_, f)| Arc::clone(f)).collect(),
    }));
    // Polling is how the soak notices a loss that no worker ran into.
    handler.enable_auto_polling(if config.device_lost.auto_polling {
        config.device_lost.poll_interval()
    } else {
        FRAME
    });
    handler.add_callback(|info| {
        warn!(reason = %info.reason, "device lost during soak: {}", info.message);
    });
    pipeline.attach_device_lost_handler(Arc::clone(&handler));

    pipeline.start().map_err(|e| anyhow::anyhow!("{}", e))?;

    let stop = Arc::new(AtomicBool::new(false));
    let enqueued = Arc::new(AtomicU64::new(0));
    let completed = Arc::new(AtomicU64::new(0));

    let producers: Vec<_> = (0..options.producers)
        .map(|index| {
            let pipeline = Arc::clone(&pipeline);
            let stop = Arc::clone(&stop);
            let enqueued = Arc::clone(&enqueued);
            let completed = Arc::clone(&completed);
            let jitter = options.jitter;
            let max_lists = options.max_lists;
            thread::Builder::new()
                .name(format!("rhiq-producer-{}", index))
                .spawn(move || produce(&pipeline, &stop, &enqueued, &completed, jitter, max_lists))
        })
        .collect::<Result<_, _>>()?;

    let started = Instant::now();
    let mut last_report = started;
    let mut injected = false;
    while started.elapsed() < options.duration {
        thread::sleep(FRAME);

        if let Some(after) = options.lose_device_after {
            if !injected && started.elapsed() >= after {
                warn!("injecting device loss on the graphics queue");
                queues[QueueType::Graphics.index()].0.lose_device();
                injected = true;
            }
        }

        if handler.tick() {
            break;
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            for (queue_type, pool) in QueueType::ALL.iter().map(|q| (*q, pipeline.pool(*q))) {
                let stats = pool.stats();
                info!(
                    queue = %queue_type,
                    free = stats.free_allocators,
                    pending = stats.pending_allocators,
                    created = stats.created_allocators,
                    "pool stats"
                );
            }
            info!(
                enqueued = enqueued.load(Ordering::Relaxed),
                completed = completed.load(Ordering::Relaxed),
                queued = pipeline.submission().queue_depth(),
                in_flight = pipeline.interrupt().queue_depth(),
                "soak progress"
            );
        }
    }

    stop.store(true, Ordering::Release);
    for producer in producers {
        if producer.join().is_err() {
            error!("producer thread panicked");
        }
    }

    let elapsed = started.elapsed();
    let pools: Vec<PoolStats> = QueueType::ALL.iter().map(|q| pipeline.pool(*q).stats()).collect();
    let submitted = pipeline.submission().submitted_payload_count();
    let batches = pipeline.submission().submitted_batch_count();

    pipeline.stop().map_err(|e| anyhow::anyhow!("{}", e))?;

    let device_lost = handler.lost_info();
    let recovery = if device_lost.is_some() {
        Some(recover(config.recovery.clone(), options.failed_recreations))
    } else {
        None
    };
    handler.shutdown();

    Ok(SoakReport {
        elapsed,
        enqueued: enqueued.load(Ordering::Relaxed),
        completed: completed.load(Ordering::Relaxed),
        submitted,
        batches,
        processed: pipeline.interrupt().processed_count(),
        abandoned: pipeline.interrupt().abandoned_count(),
        pools,
        device_lost,
        recovery,
    })
}

fn produce(
    pipeline: &SubmissionPipeline<SimBackend>,
    stop: &AtomicBool,
    enqueued: &AtomicU64,
    completed: &Arc<AtomicU64>,
    jitter: Duration,
    max_lists: usize,
) {
    let mut rng = rand::thread_rng();
    let handler = pipeline.device_lost_handler();

    while !stop.load(Ordering::Acquire) {
        if handler.as_ref().is_some_and(|h| h.is_lost()) {
            break;
        }

        let queue = QueueType::ALL[rng.gen_range(0..QueueType::COUNT)];
        let payload = if rng.gen_bool(SIGNAL_ONLY_RATIO) {
            Payload::signal_only(queue)
        } else {
            let pool = pipeline.pool(queue);
            let allocator = pool.obtain_command_allocator();
            let lists = (0..rng.gen_range(1..=max_lists))
                .map(|_| pool.obtain_command_list(&allocator))
                .collect();
            match Payload::new(queue, lists, vec![allocator]) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("failed to build payload: {}", e);
                    break;
                }
            }
        };

        let completed = Arc::clone(completed);
        let payload = payload.with_completion(move || {
            completed.fetch_add(1, Ordering::Relaxed);
        });
        if let Err(e) = pipeline.enqueue_payload(payload) {
            warn!("enqueue failed: {}", e);
            break;
        }
        enqueued.fetch_add(1, Ordering::Relaxed);

        if !jitter.is_zero() {
            let pause = rng.gen_range(0..=jitter.as_micros() as u64);
            thread::sleep(Duration::from_micros(pause));
        }
    }
}

fn recover(options: RecoveryOptions, failed_recreations: u32) -> RecoveryOutcome {
    let manager: DeviceRecoveryManager<SimDevice> = DeviceRecoveryManager::new();
    let max_retries = options.max_retries;
    manager.initialize(
        Arc::new(SimRecreator {
            failures_left: AtomicU32::new(failed_recreations),
            generation: AtomicU32::new(0),
        }),
        options,
    );

    let recreated = Arc::new(AtomicU64::new(0));
    for resource in ["object pools", "queue fences"] {
        let recreated = Arc::clone(&recreated);
        manager.add_resource_recreate_callback(move |device| {
            debug!(generation = device.generation, "recreating {}", resource);
            recreated.fetch_add(1, Ordering::Relaxed);
        });
    }

    let mut tries = 0;
    let mut recovered = false;
    while !recovered && tries <= max_retries {
        recovered = manager.attempt_recovery();
        tries += 1;
    }

    let outcome = RecoveryOutcome {
        recovered,
        attempts: tries,
        generation: manager.recovered_device().map(|d| d.generation),
        resources_recreated: recreated.load(Ordering::Relaxed),
    };
    manager.shutdown();
    outcome
}

impl SoakReport {
    pub fn print(&self) {
        let secs = self.elapsed.as_secs_f64().max(f64::EPSILON);
        println!();
        println!("rhiq soak report");
        println!("================");
        println!();
        println!("  elapsed        {:.2}s", self.elapsed.as_secs_f64());
        println!("  enqueued       {} ({:.0}/s)", self.enqueued, self.enqueued as f64 / secs);
        println!("  submitted      {} in {} batches", self.submitted, self.batches);
        println!("  completed      {}", self.completed);
        println!("  interrupts     {} processed, {} abandoned", self.processed, self.abandoned);
        println!();
        for stats in &self.pools {
            println!(
                "  {:<9} allocators created {}, free {}, pending {}; lists created {}",
                stats.queue_type.name(),
                stats.created_allocators,
                stats.free_allocators,
                stats.pending_allocators,
                stats.created_command_lists
            );
        }
        if let Some(info) = &self.device_lost {
            println!();
            println!("  device lost    {} ({})", info.reason, info.message);
        }
        if let Some(recovery) = &self.recovery {
            match recovery.generation {
                Some(generation) if recovery.recovered => println!(
                    "  recovery       succeeded after {} attempt(s), device generation {}, {} resource callback(s)",
                    recovery.attempts, generation, recovery.resources_recreated
                ),
                _ => println!("  recovery       gave up after {} attempt(s)", recovery.attempts),
            }
        }
        println!();
    }
}

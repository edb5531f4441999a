use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rhiq_core::sim::{Completion, SimBackend, SimFence, SimQueue};
use rhiq_core::{Fence, HardwareQueue, Payload, PipelineConfig, QueueType};
use rhiq_device::{DeviceLossProbe, DeviceLostHandler, DeviceLostInfo, DeviceLostReason};
use rhiq_pipeline::SubmissionPipeline;
use rhiq_vulkan::{TimelineFence, VulkanDevice, VulkanLossProbe, VulkanQueue};

const WAIT: Duration = Duration::from_secs(5);

// ── Check result types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Skip,
}

#[derive(Debug)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    message: String,
    details: Vec<String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.to_string(),
            details: Vec::new(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    fn skip(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Skip, message)
    }

    fn detail(mut self, detail: &str) -> Self {
        self.details.push(detail.to_string());
        self
    }
}

// ── Main entry point ────────────────────────────────────────────────────────

pub fn run_verify(config_path: &str) -> anyhow::Result<()> {
    let mut results: Vec<CheckResult> = Vec::new();

    let config = check_config(config_path, &mut results);
    check_sim_pipeline(&config, &mut results);
    check_device_lost(&mut results);
    check_vulkan(&mut results);

    print_results(&results);

    if results.iter().any(|r| matches!(r.status, CheckStatus::Fail)) {
        std::process::exit(1);
    }
    Ok(())
}

// ── Check 1: Configuration ──────────────────────────────────────────────────

fn check_config(config_path: &str, results: &mut Vec<CheckResult>) -> PipelineConfig {
    if !std::path::Path::new(config_path).exists() {
        results.push(
            CheckResult::warn("Configuration", &format!("Config file not found: {}", config_path))
                .detail("Using default configuration"),
        );
        return PipelineConfig::default();
    }

    match PipelineConfig::load(config_path) {
        Ok(config) => {
            results.push(
                CheckResult::pass("Configuration", &format!("Loaded from {}", config_path))
                    .detail(&format!("Max batch size: {}", config.submission.max_batch_size))
                    .detail(&format!("Fence wait slice: {} ms", config.interrupt.wait_slice_ms))
                    .detail(&format!(
                        "Recovery: auto_recreate={}, max_retries={}",
                        config.recovery.auto_recreate, config.recovery.max_retries
                    )),
            );
            config
        }
        Err(e) => {
            results.push(CheckResult::fail(
                "Configuration",
                &format!("Failed to parse {}: {}", config_path, e),
            ));
            PipelineConfig::default()
        }
    }
}

// ── Check 2: Simulated pipeline round trip ──────────────────────────────────

fn check_sim_pipeline(config: &PipelineConfig, results: &mut Vec<CheckResult>) {
    const PAYLOADS: u64 = 16;
    let name = "Simulated pipeline";

    let pipeline = SubmissionPipeline::new(Arc::new(SimBackend::new()), config.clone());
    let fence = Arc::new(SimFence::new("graphics", 0));
    let queue = Arc::new(SimQueue::new(QueueType::Graphics, fence.clone(), Completion::Immediate));
    pipeline.set_queue(QueueType::Graphics, queue, fence);

    let run = || -> Result<(), String> {
        pipeline.start().map_err(|e| e.to_string())?;
        let mut last = None;
        for _ in 0..PAYLOADS {
            let pool = pipeline.pool(QueueType::Graphics);
            let allocator = pool.obtain_command_allocator();
            let list = pool.obtain_command_list(&allocator);
            let payload = Payload::new(QueueType::Graphics, vec![list], vec![allocator]).map_err(|e| e.to_string())?;
            last = Some(pipeline.enqueue_payload(payload).map_err(|e| e.to_string())?);
        }
        match last {
            Some(sync) if sync.wait(WAIT).map_err(|e| e.to_string())? => {}
            _ => return Err("last payload did not complete".to_string()),
        }
        pipeline.submission().shutdown().map_err(|e| e.to_string())?;
        pipeline.interrupt().shutdown().map_err(|e| e.to_string())?;
        Ok(())
    };

    match run() {
        Ok(()) => {
            let stats = pipeline.pool(QueueType::Graphics).stats();
            let result = CheckResult::pass(name, &format!("{} payloads completed", PAYLOADS))
                .detail(&format!("Batches submitted: {}", pipeline.submission().submitted_batch_count()))
                .detail(&format!(
                    "Allocators: {} created, {} free after drain",
                    stats.created_allocators, stats.free_allocators
                ));
            if stats.free_allocators == stats.created_allocators {
                results.push(result);
            } else {
                results.push(CheckResult::fail(name, "allocators were not recycled"));
            }
        }
        Err(e) => results.push(CheckResult::fail(name, &e)),
    }
}

// ── Check 3: Device-loss detection ──────────────────────────────────────────

struct FenceProbe(Arc<SimFence>);

impl DeviceLossProbe for FenceProbe {
    fn check(&self) -> Option<DeviceLostInfo> {
        self.0
            .is_lost()
            .then(|| DeviceLostInfo::new(DeviceLostReason::Hung, "simulated hang"))
    }
}

fn check_device_lost(results: &mut Vec<CheckResult>) {
    let name = "Device-loss detection";
    let fence = Arc::new(SimFence::new("probe", 0));
    let handler = DeviceLostHandler::new();
    handler.initialize(Arc::new(FenceProbe(fence.clone())));

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        handler.add_callback(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    let healthy = !handler.poll();
    fence.lose_device();
    let detected = handler.poll() && handler.poll();
    let fired = fired.load(Ordering::SeqCst);

    if healthy && detected && fired == 1 {
        results.push(CheckResult::pass(name, "loss detected, callbacks fired once"));
    } else {
        results.push(
            CheckResult::fail(name, "unexpected detection behavior")
                .detail(&format!("healthy before loss: {}", healthy))
                .detail(&format!("detected: {}", detected))
                .detail(&format!("callback invocations: {}", fired)),
        );
    }
}

// ── Check 4: Vulkan backend ─────────────────────────────────────────────────

fn check_vulkan(results: &mut Vec<CheckResult>) {
    let name = "Vulkan backend";
    let device = match VulkanDevice::create(None) {
        Ok(device) => Arc::new(device),
        Err(e) => {
            results.push(CheckResult::skip(name, "no usable Vulkan 1.2 device").detail(&e.to_string()));
            return;
        }
    };
    let adapter = device.adapter().clone();

    let run = || -> Result<u64, String> {
        let fence = Arc::new(TimelineFence::new(device.clone(), "graphics", 0).map_err(|e| e.to_string())?);
        let queue = VulkanQueue::graphics(device.clone());
        queue.signal(&*fence, 1).map_err(|e| e.to_string())?;
        if !fence.wait_until(1, WAIT).map_err(|e| e.to_string())? {
            return Err("timeline signal did not complete".to_string());
        }
        if let Some(info) = VulkanLossProbe::new(fence.clone()).check() {
            return Err(format!("device reported lost: {}", info.message));
        }
        Ok(fence.completed_value())
    };

    match run() {
        Ok(value) => results.push(
            CheckResult::pass(name, &format!("timeline submit completed on {}", adapter.name))
                .detail(&format!("Vendor 0x{:04x}, device 0x{:04x}", adapter.vendor_id, adapter.device_id))
                .detail(&format!("Queue family: {}", device.queue_family()))
                .detail(&format!("Timeline value: {}", value)),
        ),
        Err(e) => results.push(CheckResult::fail(name, &e).detail(&format!("Adapter: {}", adapter.name))),
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

fn print_results(results: &[CheckResult]) {
    println!();
    println!("rhiq verification");
    println!("=================");
    println!();

    let mut pass_count = 0u32;
    let mut fail_count = 0u32;
    let mut warn_count = 0u32;

    for result in results {
        let (icon, color_start, color_end) = match result.status {
            CheckStatus::Pass => {
                pass_count += 1;
                ("[PASS]", "\x1b[32m", "\x1b[0m")
            }
            CheckStatus::Fail => {
                fail_count += 1;
                ("[FAIL]", "\x1b[31m", "\x1b[0m")
            }
            CheckStatus::Warn => {
                warn_count += 1;
                ("[WARN]", "\x1b[33m", "\x1b[0m")
            }
            CheckStatus::Skip => ("[SKIP]", "\x1b[90m", "\x1b[0m"),
        };

        println!("  {}{}{} {} - {}", color_start, icon, color_end, result.name, result.message);
        for detail in &result.details {
            println!("         {}", detail);
        }
        println!();
    }

    println!("-----------------");
    println!("  {} passed, {} failed, {} warnings", pass_count, fail_count, warn_count);
    println!();
}

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use rhiq_core::RhiError;

/// Why a device was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceLostReason {
    #[default]
    Unknown,
    /// GPU hang (timeout detection)
    Hung,
    Reset,
    DriverUpgrade,
    DriverInternalError,
    InvalidGpuCommand,
    PageFault,
    PowerEvent,
    PhysicalRemoval,
    OutOfMemory,
}

impl DeviceLostReason {
    pub fn name(self) -> &'static str {
        match self {
            DeviceLostReason::Unknown => "Unknown",
            DeviceLostReason::Hung => "Hung",
            DeviceLostReason::Reset => "Reset",
            DeviceLostReason::DriverUpgrade => "DriverUpgrade",
            DeviceLostReason::DriverInternalError => "DriverInternalError",
            DeviceLostReason::InvalidGpuCommand => "InvalidGPUCommand",
            DeviceLostReason::PageFault => "PageFault",
            DeviceLostReason::PowerEvent => "PowerEvent",
            DeviceLostReason::PhysicalRemoval => "PhysicalRemoval",
            DeviceLostReason::OutOfMemory => "OutOfMemory",
        }
    }
}

impl fmt::Display for DeviceLostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Details handed to every device-lost callback.
#[derive(Debug, Clone)]
pub struct DeviceLostInfo {
    pub reason: DeviceLostReason,
    /// Native error code (VkResult, HRESULT, ...) if the backend had one
    pub native_error_code: i32,
    pub message: String,
    /// Last GPU command known to have executed, when breadcrumbs are available
    pub last_gpu_command: Option<String>,
    /// Faulting GPU virtual address for page faults
    pub fault_address: Option<u64>,
    pub timestamp: SystemTime,
}

impl DeviceLostInfo {
    pub fn new(reason: DeviceLostReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            native_error_code: 0,
            message: message.into(),
            last_gpu_command: None,
            fault_address: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_native_error_code(mut self, code: i32) -> Self {
        self.native_error_code = code;
        self
    }

    pub fn with_fault_address(mut self, address: u64) -> Self {
        self.fault_address = Some(address);
        self
    }

    pub fn with_last_gpu_command(mut self, command: impl Into<String>) -> Self {
        self.last_gpu_command = Some(command.into());
        self
    }

    /// Build from a worker-thread error. `None` unless the error is a device loss.
    pub fn from_error(err: &RhiError) -> Option<Self> {
        match err {
            RhiError::DeviceLost { reason } => Some(Self::new(DeviceLostReason::Unknown, reason.clone())),
            _ => None,
        }
    }
}

/// Backend-specific loss detection. Returns `Some` once the device is gone.
pub trait DeviceLossProbe: Send + Sync {
    fn check(&self) -> Option<DeviceLostInfo>;
}

/// Probe for backends without any detection capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverLost;

impl DeviceLossProbe for NeverLost {
    fn check(&self) -> Option<DeviceLostInfo> {
        None
    }
}

pub type DeviceLostCallback = Arc<dyn Fn(&DeviceLostInfo) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceLostCallbackId(u64);

/// Detects device loss and notifies registered callbacks exactly once per
/// device instance.
///
/// The callback table has its own mutex, independent of any submission or
/// pool lock, and is never held while callbacks run.
pub struct DeviceLostHandler {
    probe: RwLock<Option<Arc<dyn DeviceLossProbe>>>,
    callbacks: Mutex<Vec<(DeviceLostCallbackId, DeviceLostCallback)>>,
    next_id: AtomicU64,
    lost: AtomicBool,
    lost_info: Mutex<Option<DeviceLostInfo>>,
    auto_polling: AtomicBool,
    poll_interval: Mutex<Duration>,
    last_poll: Mutex<Option<Instant>>,
}

impl DeviceLostHandler {
    pub fn new() -> Self {
        Self {
            probe: RwLock::new(None),
            callbacks: Mutex::new(Vec::with_capacity(8)),
            next_id: AtomicU64::new(1),
            lost: AtomicBool::new(false),
            lost_info: Mutex::new(None),
            auto_polling: AtomicBool::new(false),
            poll_interval: Mutex::new(Duration::from_millis(100)),
            last_poll: Mutex::new(None),
        }
    }

    /// Attach the detection probe of a (new) device and return to the normal
    /// state. Registered callbacks are kept.
    pub fn initialize(&self, probe: Arc<dyn DeviceLossProbe>) {
        *self.probe.write() = Some(probe);
        *self.lost_info.lock() = None;
        self.lost.store(false, Ordering::Release);
        debug!("device-lost handler initialized");
    }

    pub fn shutdown(&self) {
        self.disable_auto_polling();
        self.callbacks.lock().clear();
        *self.probe.write() = None;
    }

    // ── Callbacks ───────────────────────────────────────────

    pub fn add_callback(
        &self,
        callback: impl Fn(&DeviceLostInfo) + Send + Sync + 'static,
    ) -> DeviceLostCallbackId {
        let id = DeviceLostCallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: DeviceLostCallback = Arc::new(callback);
        self.callbacks.lock().push((id, callback));
        id
    }

    /// Remove a callback. Order among the remaining callbacks is not kept.
    pub fn remove_callback(&self, id: DeviceLostCallbackId) -> bool {
        let mut callbacks = self.callbacks.lock();
        match callbacks.iter().position(|(cid, _)| *cid == id) {
            Some(pos) => {
                callbacks.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    // ── Detection ───────────────────────────────────────────

    /// Ask the probe whether the device is gone, firing the callbacks on the
    /// first detection. Returns whether the device is lost.
    pub fn poll(&self) -> bool {
        if self.is_lost() {
            return true;
        }
        let probe = self.probe.read().clone();
        let Some(probe) = probe else {
            return false;
        };
        *self.last_poll.lock() = Some(Instant::now());
        match probe.check() {
            Some(info) => {
                self.transition(info);
                true
            }
            None => false,
        }
    }

    /// Push-model notification from code that ran into the loss itself.
    /// Returns `true` if this call moved the handler into the lost state.
    pub fn report(&self, info: DeviceLostInfo) -> bool {
        self.transition(info)
    }

    fn transition(&self, info: DeviceLostInfo) -> bool {
        if self
            .lost
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        error!(
            reason = %info.reason,
            code = info.native_error_code,
            "device lost: {}",
            info.message
        );
        *self.lost_info.lock() = Some(info.clone());

        let snapshot: Vec<DeviceLostCallback> =
            self.callbacks.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(&info))).is_err() {
                warn!("device-lost callback panicked; continuing with the rest");
            }
        }
        true
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn lost_info(&self) -> Option<DeviceLostInfo> {
        self.lost_info.lock().clone()
    }

    // ── Auto polling ────────────────────────────────────────

    /// Let [`tick`](Self::tick) poll at most once per `interval`. No thread is
    /// spawned; the caller's frame loop drives it.
    pub fn enable_auto_polling(&self, interval: Duration) {
        *self.poll_interval.lock() = interval;
        self.auto_polling.store(true, Ordering::Release);
        info!(interval_ms = interval.as_millis() as u64, "device-lost auto polling enabled");
    }

    pub fn disable_auto_polling(&self) {
        self.auto_polling.store(false, Ordering::Release);
    }

    pub fn is_auto_polling(&self) -> bool {
        self.auto_polling.load(Ordering::Acquire)
    }

    /// Per-frame hook. Polls when auto polling is on and the interval has
    /// elapsed; returns whether the device is lost.
    pub fn tick(&self) -> bool {
        if !self.is_auto_polling() || self.is_lost() {
            return self.is_lost();
        }
        let due = match *self.last_poll.lock() {
            Some(last) => last.elapsed() >= *self.poll_interval.lock(),
            None => true,
        };
        if due {
            self.poll()
        } else {
            false
        }
    }
}

impl Default for DeviceLostHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_names() {
        assert_eq!(DeviceLostReason::InvalidGpuCommand.name(), "InvalidGPUCommand");
        assert_eq!(DeviceLostReason::default().to_string(), "Unknown");
    }

    #[test]
    fn test_from_error_only_for_device_lost() {
        let lost = RhiError::DeviceLost { reason: "hang".to_string() };
        assert_eq!(DeviceLostInfo::from_error(&lost).unwrap().message, "hang");
        assert!(DeviceLostInfo::from_error(&RhiError::SubmitFailed("x".into())).is_none());
    }

    #[test]
    fn test_uninitialized_handler_never_lost() {
        let handler = DeviceLostHandler::new();
        assert!(!handler.poll());
        handler.initialize(Arc::new(NeverLost));
        assert!(!handler.poll());
        assert!(!handler.is_lost());
    }
}

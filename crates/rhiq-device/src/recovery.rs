use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use rhiq_core::{RecoveryOptions, RhiError};

/// Backend-specific device re-creation.
pub trait DeviceRecreator<D>: Send + Sync {
    fn recreate_device(&self, options: &RecoveryOptions) -> Result<Arc<D>, RhiError>;
}

pub type ResourceRecreateCallback<D> = Arc<dyn Fn(&Arc<D>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecreateCallbackId(u64);

struct RecoveryState<D> {
    recreator: Option<Arc<dyn DeviceRecreator<D>>>,
    options: RecoveryOptions,
    attempts: u32,
    recovered: Option<Arc<D>>,
}

/// Bounded-retry device re-creation plus replay of resource-recreate callbacks
/// against the new device.
pub struct DeviceRecoveryManager<D> {
    state: Mutex<RecoveryState<D>>,
    /// Serializes whole attempts without blocking state queries.
    attempt_lock: Mutex<()>,
    callbacks: Mutex<Vec<(RecreateCallbackId, ResourceRecreateCallback<D>)>>,
    next_id: AtomicU64,
    recovering: AtomicBool,
}

impl<D: Send + Sync + 'static> DeviceRecoveryManager<D> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RecoveryState {
                recreator: None,
                options: RecoveryOptions::default(),
                attempts: 0,
                recovered: None,
            }),
            attempt_lock: Mutex::new(()),
            callbacks: Mutex::new(Vec::with_capacity(16)),
            next_id: AtomicU64::new(1),
            recovering: AtomicBool::new(false),
        }
    }

    /// (Re)arm the manager. Resets the attempt counter.
    pub fn initialize(&self, recreator: Arc<dyn DeviceRecreator<D>>, options: RecoveryOptions) {
        let mut state = self.state.lock();
        state.recreator = Some(recreator);
        state.options = options;
        state.attempts = 0;
        state.recovered = None;
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.recreator = None;
            state.recovered = None;
        }
        self.callbacks.lock().clear();
    }

    /// Try once to recreate the device. Returns `false` without trying when
    /// recovery is disabled or the retry budget is spent.
    pub fn attempt_recovery(&self) -> bool {
        let _attempt = self.attempt_lock.lock();

        let (recreator, options, attempt) = {
            let mut state = self.state.lock();
            let Some(recreator) = state.recreator.clone() else {
                return false;
            };
            if !state.options.auto_recreate {
                return false;
            }
            if state.attempts >= state.options.max_retries {
                warn!(
                    attempts = state.attempts,
                    max_retries = state.options.max_retries,
                    "device recovery budget exhausted"
                );
                return false;
            }
            state.attempts += 1;
            (recreator, state.options.clone(), state.attempts)
        };

        self.recovering.store(true, Ordering::Release);
        info!(attempt, max_retries = options.max_retries, "attempting device recovery");

        let device = match recreator.recreate_device(&options) {
            Ok(device) => device,
            Err(e) => {
                error!(attempt, "device recreation failed: {}", e);
                self.recovering.store(false, Ordering::Release);
                return false;
            }
        };

        {
            let mut state = self.state.lock();
            state.recovered = Some(Arc::clone(&device));
            state.attempts = 0;
        }

        if options.recreate_resources {
            let snapshot: Vec<ResourceRecreateCallback<D>> =
                self.callbacks.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
            info!(callbacks = snapshot.len(), "replaying resource recreation");
            for callback in snapshot {
                if catch_unwind(AssertUnwindSafe(|| callback(&device))).is_err() {
                    warn!("resource-recreate callback panicked; continuing with the rest");
                }
            }
        }

        self.recovering.store(false, Ordering::Release);
        info!(attempt, "device recovered");
        true
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Attempts made since the last successful recovery or `initialize`.
    pub fn recovery_attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    pub fn recovered_device(&self) -> Option<Arc<D>> {
        self.state.lock().recovered.clone()
    }

    // ── Callbacks ───────────────────────────────────────────

    pub fn add_resource_recreate_callback(
        &self,
        callback: impl Fn(&Arc<D>) + Send + Sync + 'static,
    ) -> RecreateCallbackId {
        let id = RecreateCallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: ResourceRecreateCallback<D> = Arc::new(callback);
        self.callbacks.lock().push((id, callback));
        id
    }

    /// Remove a callback by swapping in the last entry.
    pub fn remove_resource_recreate_callback(&self, id: RecreateCallbackId) -> bool {
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
}

impl<D: Send + Sync + 'static> Default for DeviceRecoveryManager<D> {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::error;

use rhiq_core::RhiError;

/// Lifecycle of a pipeline worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Stopped,
    Running,
    /// Stop requested; the thread is finishing already-queued work.
    Draining,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ThreadState::Running,
            2 => ThreadState::Draining,
            _ => ThreadState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ThreadState::Stopped => 0,
            ThreadState::Running => 1,
            ThreadState::Draining => 2,
        }
    }
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ThreadState::Stopped.as_u8()))
    }

    pub(crate) fn load(&self) -> ThreadState {
        ThreadState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: ThreadState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Join handle plus an exit signal, so `stop` can wait with a timeout before
/// joining.
pub(crate) struct Worker {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    exited: Option<Receiver<()>>,
}

impl Worker {
    pub(crate) fn idle(name: &'static str) -> Self {
        Self {
            name,
            handle: None,
            exited: None,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a thread has been spawned and not yet joined.
    pub(crate) fn is_alive(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn spawn(&mut self, body: impl FnOnce() + Send + 'static) -> Result<(), RhiError> {
        // The sender is never used; dropping it (also on unwind) is the signal.
        let (exit_tx, exit_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || {
                let _exit = exit_tx;
                body();
            })
            .map_err(RhiError::ThreadSpawn)?;
        self.handle = Some(handle);
        self.exited = Some(exit_rx);
        Ok(())
    }

    /// Wait up to `timeout` for the thread to exit, then join it. Returns
    /// `false` on timeout and keeps the handle so a later call can retry.
    pub(crate) fn join_timeout(&mut self, timeout: Duration) -> bool {
        if let Some(exited) = &self.exited {
            if let Err(RecvTimeoutError::Timeout) = exited.recv_timeout(timeout) {
                return false;
            }
        }
        self.exited = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(thread = self.name, "worker thread panicked");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_state_roundtrip() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), ThreadState::Stopped);
        for state in [ThreadState::Running, ThreadState::Draining, ThreadState::Stopped] {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn test_join_timeout_keeps_handle() {
        let release = Arc::new(AtomicBool::new(false));
        let mut worker = Worker::idle("test-worker");
        {
            let release = release.clone();
            worker
                .spawn(move || {
                    while !release.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(1));
                    }
                })
                .unwrap();
        }

        assert!(!worker.join_timeout(Duration::from_millis(20)));
        assert!(worker.is_alive());

        release.store(true, Ordering::Release);
        assert!(worker.join_timeout(Duration::from_secs(5)));
        assert!(!worker.is_alive());
        assert!(worker.join_timeout(Duration::ZERO));
    }

    #[test]
    fn test_panicking_body_still_signals_exit() {
        let mut worker = Worker::idle("test-panic");
        worker.spawn(|| panic!("worker body failed")).unwrap();
        assert!(worker.join_timeout(Duration::from_secs(5)));
    }
}

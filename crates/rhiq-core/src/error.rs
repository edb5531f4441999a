use crate::queue::QueueType;

#[derive(Debug, thiserror::Error)]
pub enum RhiError {
    #[error("device lost: {reason}")]
    DeviceLost { reason: String },

    #[error("hardware submit failed: {0}")]
    SubmitFailed(String),

    #[error("fence wait failed: {0}")]
    FenceWait(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no hardware queue or fence wired for the {0} queue")]
    QueueNotWired(QueueType),

    #[error("{thread} thread did not stop within {timeout_ms} ms")]
    ShutdownTimeout { thread: &'static str, timeout_ms: u64 },

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RhiError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RhiError::DeviceLost { .. })
    }
}

/// Report an unrecoverable backend failure and abort the calling thread.
///
/// Used where the pool or the worker threads have no sane way to continue,
/// e.g. the backend could not construct a command allocator.
#[track_caller]
pub fn fatal(context: &str, err: RhiError) -> ! {
    tracing::error!(error = %err, "fatal: {}", context);
    panic!("{}: {}", context, err);
}

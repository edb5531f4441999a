//! GPU fence abstraction.
//!
//! A fence is a per-queue monotonic 64-bit counter advanced by the GPU. The CPU
//! may read the last completed value or block until a target value is reached.
//! This trait, together with [`crate::backend`], is the only seam between the
//! pipeline and a concrete graphics API.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RhiError;

pub trait Fence: Send + Sync + 'static {
    /// Highest value the GPU has finished.
    fn completed_value(&self) -> u64;

    /// Block until `completed_value() >= value` or `timeout` expires.
    ///
    /// Returns `Ok(true)` once the value is reached and `Ok(false)` on timeout.
    fn wait_until(&self, value: u64, timeout: Duration) -> Result<bool, RhiError>;

    /// Human-readable name used in log output.
    fn debug_name(&self) -> &str {
        "fence"
    }

    /// Lets a backend recover its concrete fence type at submit time.
    fn as_any(&self) -> &dyn Any;
}

/// Whether two fence handles refer to the same fence object.
#[inline]
pub fn same_fence(a: &Arc<dyn Fence>, b: &Arc<dyn Fence>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// A fence/value pair identifying one point on a queue's timeline.
#[derive(Clone)]
pub struct SyncPoint {
    pub fence: Arc<dyn Fence>,
    pub value: u64,
}

impl SyncPoint {
    pub fn new(fence: Arc<dyn Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    pub fn is_completed(&self) -> bool {
        self.fence.completed_value() >= self.value
    }

    /// Block until this point completes. Returns `Ok(false)` on timeout; callers
    /// should check for device loss when that happens.
    pub fn wait(&self, timeout: Duration) -> Result<bool, RhiError> {
        if self.is_completed() {
            return Ok(true);
        }
        self.fence.wait_until(self.value, timeout)
    }
}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("fence", &self.fence.debug_name())
            .field("value", &self.value)
            .finish()
    }
}

impl PartialEq for SyncPoint {
    fn eq(&self, other: &Self) -> bool {
        same_fence(&self.fence, &other.fence) && self.value == other.value
    }
}

impl Eq for SyncPoint {}

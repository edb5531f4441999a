//! Device-loss detection and bounded-retry device recovery.
//!
//! Both are observers off the per-payload hot path: the submission and
//! interrupt threads only report losses they run into, and the per-frame tick
//! polls for the rest.

pub mod lost;
pub mod recovery;

pub use lost::{
    DeviceLossProbe, DeviceLostCallback, DeviceLostCallbackId, DeviceLostHandler, DeviceLostInfo,
    DeviceLostReason, NeverLost,
};
pub use recovery::{
    DeviceRecoveryManager, DeviceRecreator, RecreateCallbackId, ResourceRecreateCallback,
};
pub use rhiq_core::RecoveryOptions;

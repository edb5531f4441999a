pub mod backend;
pub mod config;
pub mod error;
pub mod fence;
pub mod handoff;
pub mod object_pool;
pub mod payload;
pub mod queue;
pub mod sim;

pub use backend::{Backend, HardwareQueue};
pub use config::{PipelineConfig, RecoveryOptions};
pub use error::{fatal, RhiError};
pub use fence::{Fence, SyncPoint};
pub use handoff::HandoffQueue;
pub use object_pool::{ObjectPool, PoolStats, PooledAllocator};
pub use payload::{CompletionCallback, Payload, PayloadParts, PendingInterrupt};
pub use queue::{PerQueue, QueueType};

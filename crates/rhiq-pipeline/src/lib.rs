//! The two long-lived worker threads of the submission pipeline.
//!
//! Recording threads hand finished [`Payload`](rhiq_core::Payload)s to the
//! [`SubmissionThread`], which batches and submits them and forwards one
//! [`PendingInterrupt`](rhiq_core::PendingInterrupt) per payload to the
//! [`InterruptThread`]. The interrupt thread waits on the queue fences and
//! hands command allocators back to their [`ObjectPool`](rhiq_core::ObjectPool)
//! once the GPU is done with them.

pub mod interrupt;
pub mod pipeline;
pub mod submission;
mod worker;

pub use interrupt::{InterruptSender, InterruptThread};
pub use pipeline::SubmissionPipeline;
pub use submission::SubmissionThread;
pub use worker::ThreadState;

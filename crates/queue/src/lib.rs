//! The analysis job bus (C4): three priority lanes, idempotent enqueue,
//! lease-and-retry semantics, and the tagged-union event shapes a worker
//! publishes back over pub/sub.

pub mod backend;
pub mod events;
pub mod model;
pub mod queue;

pub use backend::{QueueBackend, RedisQueueBackend};
pub use events::AnalysisEvent;
pub use model::{Job, JobPayload, JobPriority};
pub use queue::{run_stall_sweeper, AnalysisQueue, RetryOutcome};

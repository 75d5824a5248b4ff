//! quartz-lite: a recurring/scheduled-job execution engine.
//!
//! Callers register named functions with a cron expression or a one-shot
//! execution time and a priority; the host guarantees each due function
//! runs at most once per owner across cooperating node instances sharing
//! one occurrence store, retries and records failures, and reclaims
//! occurrences orphaned by a crashed node.

pub mod config;
pub mod error;
pub mod notify;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use config::{SchedulerConfig, ThrottleConfig};
pub use error::{QuartzError, Result};
pub use notify::{NoopSink, NotificationSink, TracingSink};
pub use registry::{JobContext, JobDefinition, JobRegistry, Priority, RetryPolicy};
pub use scheduler::{Occurrence, OccurrenceKind, OccurrenceStatus, SchedulerHost};
pub use store::{DueSet, MemoryStore, OccurrenceStore};

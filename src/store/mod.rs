//! Persistence contract for occurrence state.
//!
//! The occurrence table is the single source of truth shared across node
//! instances; all cross-node coordination goes through the atomic claim
//! operation ("claim if still Idle"), never cooperative locking. Concrete
//! SQL/HTTP backends implement this trait; [`MemoryStore`] is the in-process
//! backend used by tests and the demo binary.

pub mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::occurrence::{Occurrence, OccurrenceStatus};

/// The occurrences sharing the earliest upcoming due time, and how long
/// until that time. `wait: None` is the "nothing pending" sentinel.
#[derive(Debug, Clone, Default)]
pub struct DueSet {
    pub wait: Option<Duration>,
    pub occurrences: Vec<Occurrence>,
}

impl DueSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when the set is non-empty and already due at the time it was
    /// computed.
    pub fn is_due_now(&self) -> bool {
        !self.occurrences.is_empty() && self.wait == Some(Duration::ZERO)
    }
}

#[async_trait]
pub trait OccurrenceStore: Send + Sync {
    /// All Idle occurrences sharing the earliest due time. When several
    /// occurrences fire at the same instant they are all returned in one
    /// call so simultaneous cron firings dispatch together.
    async fn next_due_set(&self, now: DateTime<Utc>) -> Result<DueSet>;

    /// Atomic per-row Idle -> Queued transition stamped with `lock_holder`.
    /// Returns only the rows this caller won; losing a race is silent
    /// normal flow, not an error.
    async fn claim(&self, lock_holder: &str, ids: &[Uuid]) -> Result<Vec<Occurrence>>;

    /// Queued -> InProgress, recorded immediately before the body runs.
    async fn mark_in_progress(&self, id: Uuid) -> Result<()>;

    /// Record a terminal status with elapsed time and optional error text.
    async fn mark_terminal(
        &self,
        id: Uuid,
        status: OccurrenceStatus,
        elapsed_ms: u64,
        error: Option<String>,
    ) -> Result<()>;

    /// Any non-terminal occurrence -> Cancelled. Returns whether a
    /// non-terminal row existed.
    async fn mark_cancelled(&self, id: Uuid) -> Result<bool>;

    /// Flag a reclaimed occurrence on the row itself, so recovered
    /// executions stay distinguishable after the fact.
    async fn mark_recovered(&self, id: Uuid) -> Result<()>;

    /// Queued/InProgress rows whose lease has been held past `liveness`.
    async fn orphaned(&self, liveness: Duration, now: DateTime<Utc>) -> Result<Vec<Occurrence>>;

    /// Queued/InProgress rows held by a node known to be dead.
    async fn orphaned_for_node(&self, node_id: &str) -> Result<Vec<Occurrence>>;

    /// Release the given rows back to Idle, clearing the lease.
    async fn release(&self, ids: &[Uuid]) -> Result<()>;

    /// Release every row leased by `lock_holder`; used on shutdown.
    async fn release_all(&self, lock_holder: &str) -> Result<()>;

    /// Insert a freshly materialized occurrence.
    async fn insert(&self, occurrence: Occurrence) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Occurrence>>;

    /// Whether any Idle occurrence exists for the named function; drives
    /// the recurring planner's one-pending-occurrence rule.
    async fn has_pending(&self, function_name: &str) -> Result<bool>;
}

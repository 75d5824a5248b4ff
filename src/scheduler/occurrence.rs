use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one occurrence.
///
/// `Idle -> Queued -> InProgress -> {Done | Failed | Cancelled | Skipped}`.
/// The four right-hand states are terminal for that occurrence; a recurring
/// schedule produces a fresh occurrence independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccurrenceStatus {
    Idle,
    Queued,
    InProgress,
    Done,
    Failed,
    Cancelled,
    Skipped,
}

impl OccurrenceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OccurrenceStatus::Done
                | OccurrenceStatus::Failed
                | OccurrenceStatus::Cancelled
                | OccurrenceStatus::Skipped
        )
    }

    /// A live lease is a claim some node currently holds on the occurrence.
    pub fn is_live_lease(&self) -> bool {
        matches!(self, OccurrenceStatus::Queued | OccurrenceStatus::InProgress)
    }
}

impl std::fmt::Display for OccurrenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OccurrenceStatus::Idle => write!(f, "idle"),
            OccurrenceStatus::Queued => write!(f, "queued"),
            OccurrenceStatus::InProgress => write!(f, "in_progress"),
            OccurrenceStatus::Done => write!(f, "done"),
            OccurrenceStatus::Failed => write!(f, "failed"),
            OccurrenceStatus::Cancelled => write!(f, "cancelled"),
            OccurrenceStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccurrenceKind {
    /// A single explicitly scheduled execution.
    OneShot,
    /// One firing of a cron schedule.
    Recurring,
}

/// One concrete scheduled instance of a registered function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: Uuid,
    pub function_name: String,
    pub kind: OccurrenceKind,
    /// One-shots may chain into children; set to the spawning occurrence.
    pub parent_id: Option<Uuid>,
    pub status: OccurrenceStatus,
    pub retry_count: u32,
    pub scheduled_for: DateTime<Utc>,
    /// True when this occurrence was produced by the orphan sweep rather
    /// than dispatched on time.
    pub recovered: bool,
    /// Identity of the node holding the lease, while Queued/InProgress.
    pub lock_holder: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl Occurrence {
    pub fn new_recurring(function_name: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        Self::new(function_name, OccurrenceKind::Recurring, scheduled_for)
    }

    pub fn new_one_shot(function_name: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        Self::new(function_name, OccurrenceKind::OneShot, scheduled_for)
    }

    fn new(function_name: impl Into<String>, kind: OccurrenceKind, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            function_name: function_name.into(),
            kind,
            parent_id: None,
            status: OccurrenceStatus::Idle,
            retry_count: 0,
            scheduled_for,
            recovered: false,
            lock_holder: None,
            locked_at: None,
            executed_at: None,
            elapsed_ms: None,
            last_error: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Fresh Idle occurrence re-materialized from a failed one, due at
    /// `scheduled_for`, carrying the incremented retry count.
    pub fn retry_of(failed: &Occurrence, scheduled_for: DateTime<Utc>) -> Self {
        let mut next = Self::new(failed.function_name.clone(), failed.kind, scheduled_for);
        next.parent_id = failed.parent_id;
        next.retry_count = failed.retry_count + 1;
        next
    }
}

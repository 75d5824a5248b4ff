use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::occurrence::{Occurrence, OccurrenceStatus};
use crate::store::{DueSet, OccurrenceStore};

/// In-memory occurrence table.
///
/// Mutations take the single write lock, which gives every row transition
/// the same atomicity a SQL backend provides with a conditional UPDATE:
/// two nodes racing `claim` on one row produce exactly one winner.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<Uuid, Occurrence>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, sorted by scheduled time. Test/debug helper.
    pub async fn all(&self) -> Vec<Occurrence> {
        let rows = self.rows.read().await;
        let mut out: Vec<Occurrence> = rows.values().cloned().collect();
        out.sort_by_key(|o| o.scheduled_for);
        out
    }

    /// Drop terminal rows, returning how many were removed.
    pub async fn prune_terminal(&self) -> usize {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, o| !o.status.is_terminal());
        before - rows.len()
    }
}

#[async_trait]
impl OccurrenceStore for MemoryStore {
    async fn next_due_set(&self, now: DateTime<Utc>) -> Result<DueSet> {
        let rows = self.rows.read().await;
        let earliest = rows
            .values()
            .filter(|o| o.status == OccurrenceStatus::Idle)
            .map(|o| o.scheduled_for)
            .min();

        let Some(earliest) = earliest else {
            return Ok(DueSet::empty());
        };

        let occurrences: Vec<Occurrence> = rows
            .values()
            .filter(|o| o.status == OccurrenceStatus::Idle && o.scheduled_for == earliest)
            .cloned()
            .collect();

        let wait = (earliest - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Ok(DueSet {
            wait: Some(wait),
            occurrences,
        })
    }

    async fn claim(&self, lock_holder: &str, ids: &[Uuid]) -> Result<Vec<Occurrence>> {
        let mut rows = self.rows.write().await;
        let now = Utc::now();
        let mut won = Vec::new();
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == OccurrenceStatus::Idle {
                    row.status = OccurrenceStatus::Queued;
                    row.lock_holder = Some(lock_holder.to_string());
                    row.locked_at = Some(now);
                    won.push(row.clone());
                }
            }
        }
        Ok(won)
    }

    async fn mark_in_progress(&self, id: Uuid) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.get_mut(&id) {
            if row.status == OccurrenceStatus::Queued {
                row.status = OccurrenceStatus::InProgress;
                row.executed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: OccurrenceStatus,
        elapsed_ms: u64,
        error: Option<String>,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.get_mut(&id) {
            if !row.status.is_terminal() {
                row.status = status;
                row.elapsed_ms = Some(elapsed_ms);
                row.last_error = error;
                row.lock_holder = None;
                row.locked_at = None;
            }
        }
        Ok(())
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.get_mut(&id) {
            if !row.status.is_terminal() {
                row.status = OccurrenceStatus::Cancelled;
                row.lock_holder = None;
                row.locked_at = None;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_recovered(&self, id: Uuid) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.get_mut(&id) {
            row.recovered = true;
        }
        Ok(())
    }

    async fn orphaned(&self, liveness: Duration, now: DateTime<Utc>) -> Result<Vec<Occurrence>> {
        let threshold = chrono::Duration::from_std(liveness)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|o| {
                o.status.is_live_lease()
                    && o.locked_at.is_some_and(|at| now - at > threshold)
            })
            .cloned()
            .collect())
    }

    async fn orphaned_for_node(&self, node_id: &str) -> Result<Vec<Occurrence>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|o| o.status.is_live_lease() && o.lock_holder.as_deref() == Some(node_id))
            .cloned()
            .collect())
    }

    async fn release(&self, ids: &[Uuid]) -> Result<()> {
        let mut rows = self.rows.write().await;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status.is_live_lease() {
                    row.status = OccurrenceStatus::Idle;
                    row.lock_holder = None;
                    row.locked_at = None;
                }
            }
        }
        Ok(())
    }

    async fn release_all(&self, lock_holder: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        for row in rows.values_mut() {
            if row.status.is_live_lease() && row.lock_holder.as_deref() == Some(lock_holder) {
                row.status = OccurrenceStatus::Idle;
                row.lock_holder = None;
                row.locked_at = None;
            }
        }
        Ok(())
    }

    async fn insert(&self, occurrence: Occurrence) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert(occurrence.id, occurrence);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Occurrence>> {
        let rows = self.rows.read().await;
        Ok(rows.get(&id).cloned())
    }

    async fn has_pending(&self, function_name: &str) -> Result<bool> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .any(|o| o.status == OccurrenceStatus::Idle && o.function_name == function_name))
    }
}

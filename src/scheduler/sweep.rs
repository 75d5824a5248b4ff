//! Orphan-reclaim sweep.
//!
//! A lease held past the liveness timeout means its node crashed or stalled
//! mid-execution. This secondary loop runs on its own period, finds such
//! rows, and re-dispatches them the same way the main loop does, flagging
//! them as recovered so logging can tell an on-time run from a reclaimed
//! one.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::host::{dispatch_occurrence, orphan_exhausted, HostInner};
use crate::scheduler::occurrence::OccurrenceStatus;

pub(crate) async fn run(inner: Arc<HostInner>, token: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; skip it so a freshly started
    // host does not sweep before anything can be orphaned.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = sweep_once(&inner).await {
            // Transient backend errors are retried on the next tick.
            tracing::warn!(error = %e, "Orphan sweep failed");
        }
    }
}

async fn sweep_once(inner: &Arc<HostInner>) -> Result<()> {
    let now = Utc::now();
    let orphans = inner
        .store
        .orphaned(inner.config.liveness_timeout, now)
        .await?;
    if orphans.is_empty() {
        return Ok(());
    }

    // The host may legitimately sit in paused/manual mode; leave the rows
    // for a later tick instead of failing dispatch.
    if inner.pool.is_frozen() || inner.pool.is_closed() {
        tracing::debug!(count = orphans.len(), "Pool unavailable; skipping orphan dispatch");
        return Ok(());
    }

    tracing::info!(count = orphans.len(), "Reclaiming orphaned occurrences");
    for occurrence in orphans {
        let Some(def) = inner.registry.get(&occurrence.function_name) else {
            inner
                .store
                .mark_terminal(
                    occurrence.id,
                    OccurrenceStatus::Skipped,
                    0,
                    Some(format!(
                        "function not registered: {}",
                        occurrence.function_name
                    )),
                )
                .await?;
            continue;
        };

        if orphan_exhausted(&occurrence, &def) {
            inner
                .store
                .mark_terminal(
                    occurrence.id,
                    OccurrenceStatus::Failed,
                    0,
                    Some("lease exceeded liveness timeout with no retries remaining".to_string()),
                )
                .await?;
            continue;
        }

        inner.store.release(&[occurrence.id]).await?;
        let won = inner
            .store
            .claim(&inner.config.node_id, &[occurrence.id])
            .await?;
        // A peer's sweep may have raced us to the reclaim; that is fine.
        for mut reclaimed in won {
            reclaimed.recovered = true;
            inner.store.mark_recovered(reclaimed.id).await?;
            dispatch_occurrence(inner, reclaimed, def.clone(), true).await;
        }
    }
    Ok(())
}

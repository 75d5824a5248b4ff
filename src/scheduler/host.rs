//! The scheduling control loop and its public control surface.
//!
//! One host instance drives three concurrent pieces: the main wake/sleep
//! loop (lease the due set, dispatch, sleep until the next due time), the
//! orphan sweep, and the work-stealing pool. The loop owns no timer tick;
//! it arms a single interruptible sleep for the earliest pending occurrence
//! and the restart throttle is the only inbound signal that cuts that sleep
//! short.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{QuartzError, Result};
use crate::notify::NotificationSink;
use crate::pool::{WorkItem, WorkStealingPool};
use crate::registry::{JobContext, JobDefinition, JobRegistry};
use crate::scheduler::cancel::CancellationRegistry;
use crate::scheduler::occurrence::{Occurrence, OccurrenceKind, OccurrenceStatus};
use crate::scheduler::sweep;
use crate::scheduler::throttle::RestartThrottle;
use crate::store::OccurrenceStore;

pub struct SchedulerHost {
    inner: Arc<HostInner>,
}

pub(crate) struct HostInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) store: Arc<dyn OccurrenceStore>,
    pub(crate) pool: WorkStealingPool,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) cancellations: CancellationRegistry,
    throttle: RestartThrottle,
    /// Wakes the armed sleep; carries a permit so a signal that lands while
    /// the loop is mid-iteration is not lost.
    wake: Arc<Notify>,
    /// The occurrence time the current sleep is armed for, when sleeping.
    armed: parking_lot::Mutex<Option<DateTime<Utc>>>,
    running: AtomicBool,
    lifetime: parking_lot::Mutex<Option<CancellationToken>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerHost {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<JobRegistry>,
        store: Arc<dyn OccurrenceStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let throttle = {
            let wake = wake.clone();
            RestartThrottle::new(config.throttle.clone(), move || {
                wake.notify_one();
            })
        };
        let pool = WorkStealingPool::new(config.max_concurrency, config.idle_worker_timeout, sink.clone());
        Self {
            inner: Arc::new(HostInner {
                config,
                registry,
                store,
                pool,
                sink,
                cancellations: CancellationRegistry::new(),
                throttle,
                wake,
                armed: parking_lot::Mutex::new(None),
                running: AtomicBool::new(false),
                lifetime: parking_lot::Mutex::new(None),
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the scheduling loop and the orphan sweep.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.pool.is_closed() {
            return Err(QuartzError::PoolClosed);
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(QuartzError::AlreadyRunning);
        }
        inner.pool.resume();

        let token = CancellationToken::new();
        *inner.lifetime.lock() = Some(token.clone());

        let loop_handle = tokio::spawn(run_loop(inner.clone(), token.clone()));
        let sweep_handle = tokio::spawn(sweep::run(inner.clone(), token));
        let mut tasks = inner.tasks.lock();
        tasks.push(loop_handle);
        tasks.push(sweep_handle);
        tracing::info!(node = %inner.config.node_id, "Scheduler host started");
        Ok(())
    }

    /// Cancel the loop, wait for it to exit, and freeze the pool. Leases
    /// held by this node are released by the exiting loop. In-flight work
    /// keeps running; use [`SchedulerHost::shutdown`] to drain it.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let Some(token) = inner.lifetime.lock().take() else {
            return;
        };
        token.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *inner.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
        inner.running.store(false, Ordering::SeqCst);
        inner.pool.freeze();
        tracing::info!(node = %inner.config.node_id, "Scheduler host stopped");
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop and drain in-flight work, bounded by the configured drain
    /// timeout. Returns whether the drain completed. The host cannot be
    /// started again afterwards.
    pub async fn shutdown(&self) -> bool {
        self.stop().await;
        self.inner.pool.shutdown(self.inner.config.drain_timeout).await
    }

    /// Request a throttled loop restart when `candidate` may run sooner
    /// than whatever the loop is currently armed for.
    pub fn restart_if_needed(&self, candidate: DateTime<Utc>) {
        self.inner.restart_if_needed(candidate);
    }

    /// Signal cancellation for a queued or running occurrence and mark its
    /// row Cancelled. Returns whether anything live existed for `id`.
    pub async fn request_cancellation(&self, id: Uuid) -> bool {
        let signalled = self.inner.cancellations.request_cancellation(id);
        let marked = match self.inner.store.mark_cancelled(id).await {
            Ok(marked) => marked,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to mark occurrence cancelled");
                false
            }
        };
        signalled || marked
    }

    /// Materialize a one-shot occurrence of a registered function at `at`,
    /// waking the loop if it now runs soonest.
    pub async fn schedule_once(
        &self,
        function_name: &str,
        at: DateTime<Utc>,
        parent_id: Option<Uuid>,
    ) -> Result<Uuid> {
        if self.inner.registry.get(function_name).is_none() {
            return Err(QuartzError::FunctionNotFound(function_name.to_string()));
        }
        let mut occ = Occurrence::new_one_shot(function_name, at);
        if let Some(parent) = parent_id {
            occ = occ.with_parent(parent);
        }
        let id = occ.id;
        self.inner.store.insert(occ).await?;
        tracing::debug!(id = %id, job = function_name, at = %at, "One-shot occurrence scheduled");
        self.inner.restart_if_needed(at);
        Ok(id)
    }

    /// Reject pool submissions without stopping the loop; the sweep and the
    /// loop both skip dispatch while paused.
    pub fn pause_dispatch(&self) {
        self.inner.pool.freeze();
    }

    pub fn resume_dispatch(&self) {
        self.inner.pool.resume();
        self.inner.wake.notify_one();
    }

    pub fn pool(&self) -> &WorkStealingPool {
        &self.inner.pool
    }

    /// Reclaim every lease held by a node known (externally) to be dead.
    pub async fn reclaim_dead_node(&self, node_id: &str) -> Result<usize> {
        let orphans = self.inner.store.orphaned_for_node(node_id).await?;
        if orphans.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = orphans.iter().map(|o| o.id).collect();
        self.inner.store.release(&ids).await?;
        tracing::info!(node = node_id, count = ids.len(), "Released leases of dead node");
        self.inner.wake.notify_one();
        Ok(ids.len())
    }
}

impl HostInner {
    pub(crate) fn restart_if_needed(&self, candidate: DateTime<Utc>) {
        let armed = *self.armed.lock();
        let tolerance = chrono::Duration::from_std(self.config.restart_tolerance)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let needed = match armed {
            None => true,
            Some(current) => candidate < current - tolerance,
        };
        if needed {
            self.throttle.signal();
        }
    }
}

async fn run_loop(inner: Arc<HostInner>, token: CancellationToken) {
    inner.sink.on_host_status_changed(true);
    loop {
        if token.is_cancelled() {
            break;
        }
        if let Err(e) = iteration(&inner, &token).await {
            tracing::error!(error = %e, "Scheduler iteration failed");
            inner.sink.on_host_exception(&e.to_string());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(inner.config.error_backoff) => {}
            }
        }
    }
    *inner.armed.lock() = None;
    if let Err(e) = inner.store.release_all(&inner.config.node_id).await {
        tracing::warn!(error = %e, "Failed to release leases on exit");
    }
    inner.sink.on_host_status_changed(false);
}

/// One pass of the loop: plan recurring occurrences, read the due set, and
/// either dispatch it now or arm one interruptible sleep until it is due.
async fn iteration(inner: &Arc<HostInner>, token: &CancellationToken) -> Result<()> {
    let now = Utc::now();
    plan_recurring(inner, now).await?;

    let due = inner.store.next_due_set(now).await?;
    inner
        .sink
        .on_next_occurrence_changed(due.occurrences.first().map(|o| o.scheduled_for));

    if due.is_due_now() {
        if inner.pool.is_frozen() || inner.pool.is_closed() {
            // Dispatch is paused; claiming now would only bounce leases.
            arm_sleep(inner, token, inner.config.error_backoff, None).await;
            return Ok(());
        }
        return dispatch_due_set(inner, &due.occurrences).await;
    }
    match due.wait {
        Some(wait) => {
            let armed_for = due.occurrences.first().map(|o| o.scheduled_for);
            arm_sleep(inner, token, wait, armed_for).await;
        }
        // Nothing pending: behave as "wait indefinitely" with a bounded,
        // interruptible sleep.
        None => arm_sleep(inner, token, inner.config.max_sleep, None).await,
    }
    Ok(())
}

/// Keep exactly one future Idle occurrence materialized per cron job.
async fn plan_recurring(inner: &Arc<HostInner>, now: DateTime<Utc>) -> Result<()> {
    for def in inner.registry.recurring() {
        if inner.store.has_pending(&def.name).await? {
            continue;
        }
        if let Some(next) = def.next_occurrence_after(now) {
            let occ = Occurrence::new_recurring(&def.name, next);
            tracing::debug!(job = %def.name, at = %next, "Planned recurring occurrence");
            inner.store.insert(occ).await?;
        }
    }
    Ok(())
}

async fn arm_sleep(
    inner: &Arc<HostInner>,
    token: &CancellationToken,
    wait: Duration,
    armed_for: Option<DateTime<Utc>>,
) {
    *inner.armed.lock() = armed_for;
    let capped = wait.min(inner.config.max_sleep);
    tokio::select! {
        _ = token.cancelled() => {}
        _ = inner.wake.notified() => {
            tracing::trace!("Armed sleep interrupted by restart signal");
        }
        _ = tokio::time::sleep(capped) => {}
    }
    *inner.armed.lock() = None;
}

/// Lease the due set and hand the won rows to the pool in priority order.
async fn dispatch_due_set(inner: &Arc<HostInner>, due: &[Occurrence]) -> Result<()> {
    let ids: Vec<Uuid> = due.iter().map(|o| o.id).collect();
    let won = inner.store.claim(&inner.config.node_id, &ids).await?;
    if won.len() < ids.len() {
        // Peers claimed the rest; losing a claim race is normal flow.
        tracing::debug!(
            won = won.len(),
            contested = ids.len() - won.len(),
            "Partial due-set claim"
        );
    }

    let mut batch: Vec<(Occurrence, Arc<JobDefinition>)> = Vec::with_capacity(won.len());
    for occ in won {
        match inner.registry.get(&occ.function_name) {
            Some(def) => batch.push((occ, def)),
            None => {
                tracing::warn!(job = %occ.function_name, "Occurrence for unregistered function skipped");
                inner
                    .store
                    .mark_terminal(
                        occ.id,
                        OccurrenceStatus::Skipped,
                        0,
                        Some(format!("function not registered: {}", occ.function_name)),
                    )
                    .await?;
            }
        }
    }
    batch.sort_by_key(|(_, def)| def.priority);

    for (occ, def) in batch {
        dispatch_occurrence(inner, occ, def, false).await;
    }
    Ok(())
}

/// Submit one leased occurrence to the pool; on rejection the lease is
/// released back to Idle so another pass (or node) can pick it up.
pub(crate) async fn dispatch_occurrence(
    inner: &Arc<HostInner>,
    occurrence: Occurrence,
    def: Arc<JobDefinition>,
    recovered: bool,
) {
    let id = occurrence.id;
    let token = CancellationToken::new();
    inner.cancellations.register(id, token.clone());

    let body = run_occurrence(inner.clone(), occurrence, def.clone(), token.clone(), recovered);
    let item = WorkItem::new(def.priority, token, Box::pin(body));
    if let Err(e) = inner.pool.submit(item) {
        tracing::warn!(id = %id, error = %e, "Pool rejected dispatch; releasing lease");
        inner.cancellations.deregister(id);
        if let Err(e) = inner.store.release(&[id]).await {
            tracing::warn!(id = %id, error = %e, "Failed to release rejected occurrence");
        }
    }
}

/// The worker-side wrapper around the job body: records InProgress, runs
/// the invocable under its cancellation token, records the terminal status
/// with elapsed time, and re-materializes a retry when budget remains.
/// Errors here are logged, never propagated; the pool and loop must not
/// see job-body failures.
async fn run_occurrence(
    inner: Arc<HostInner>,
    occurrence: Occurrence,
    def: Arc<JobDefinition>,
    token: CancellationToken,
    recovered: bool,
) {
    let id = occurrence.id;
    if token.is_cancelled() {
        inner.cancellations.deregister(id);
        if let Err(e) = inner.store.mark_cancelled(id).await {
            tracing::warn!(id = %id, error = %e, "Failed to record cancellation");
        }
        return;
    }

    if let Err(e) = inner.store.mark_in_progress(id).await {
        tracing::warn!(id = %id, error = %e, "Failed to mark occurrence in progress");
    }

    let ctx = JobContext {
        occurrence_id: id,
        function_name: occurrence.function_name.clone(),
        retry_count: occurrence.retry_count,
        scheduled_for: occurrence.scheduled_for,
        recovered: recovered || occurrence.recovered,
    };

    let started = tokio::time::Instant::now();
    let outcome = tokio::select! {
        result = (def.invocable)(ctx, token.clone()) => Some(result),
        _ = token.cancelled() => None,
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;
    inner.cancellations.deregister(id);

    let record = match outcome {
        None => {
            tracing::info!(id = %id, job = %def.name, "Occurrence cancelled mid-execution");
            inner
                .store
                .mark_terminal(id, OccurrenceStatus::Cancelled, elapsed_ms, None)
                .await
        }
        Some(Ok(())) => {
            tracing::debug!(id = %id, job = %def.name, elapsed_ms, "Occurrence done");
            inner
                .store
                .mark_terminal(id, OccurrenceStatus::Done, elapsed_ms, None)
                .await
        }
        Some(Err(error)) => {
            let text = error.to_string();
            tracing::warn!(id = %id, job = %def.name, elapsed_ms, error = %text, "Occurrence failed");
            let result = inner
                .store
                .mark_terminal(id, OccurrenceStatus::Failed, elapsed_ms, Some(text))
                .await;
            schedule_retry(&inner, &occurrence, &def).await;
            result
        }
    };
    if let Err(e) = record {
        tracing::warn!(id = %id, error = %e, "Failed to record terminal status");
    }
}

/// Re-materialize a failed occurrence as a fresh Idle one when retries
/// remain, due after the policy's backoff for this attempt.
async fn schedule_retry(inner: &Arc<HostInner>, failed: &Occurrence, def: &JobDefinition) {
    if failed.retry_count >= def.retry.retries {
        return;
    }
    let backoff = def.retry.backoff_for(failed.retry_count);
    let at = Utc::now()
        + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(30));
    let retry = Occurrence::retry_of(failed, at);
    tracing::info!(
        id = %failed.id,
        job = %def.name,
        attempt = retry.retry_count,
        at = %at,
        "Scheduling retry"
    );
    if let Err(e) = inner.store.insert(retry).await {
        tracing::warn!(id = %failed.id, error = %e, "Failed to materialize retry");
        return;
    }
    inner.restart_if_needed(at);
}

/// Whether an orphaned one-shot has exhausted its retry budget; used by the
/// sweep to decide between reclaim and terminal failure.
pub(crate) fn orphan_exhausted(occurrence: &Occurrence, def: &JobDefinition) -> bool {
    occurrence.kind == OccurrenceKind::OneShot && occurrence.retry_count >= def.retry.retries
}

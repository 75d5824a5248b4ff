//! Elastic work-stealing execution pool.
//!
//! Each worker owns a private FIFO queue; submission round-robins across the
//! queue slots and workers are spawned lazily up to the configured maximum. A
//! worker that drains its own queue steals one item from a peer before going
//! idle, and idle workers self-terminate after a timeout. LongRunning work is
//! handed straight to a dedicated task so one slow job cannot starve the
//! pooled workers.

pub mod item;

pub use item::WorkItem;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::seq::SliceRandom;
use tokio::sync::Notify;

use crate::error::{QuartzError, Result};
use crate::notify::NotificationSink;
use crate::registry::Priority;

pub struct WorkStealingPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// One queue slot per potential worker; worker `i` owns `queues[i]`.
    queues: Vec<parking_lot::Mutex<VecDeque<WorkItem>>>,
    /// Slots not currently owned by a live worker. Also serializes spawn
    /// and retire decisions.
    free_slots: parking_lot::Mutex<Vec<usize>>,
    /// Wakes one idle worker when work arrives.
    wake: Notify,
    /// Notified whenever queued+executing drops; drives shutdown drain.
    drained: Notify,
    active_workers: AtomicUsize,
    queued: AtomicUsize,
    executing: AtomicUsize,
    frozen: AtomicBool,
    closed: AtomicBool,
    next_slot: AtomicUsize,
    idle_timeout: Duration,
    sink: Arc<dyn NotificationSink>,
}

impl PoolInner {
    fn total_work(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.executing.load(Ordering::SeqCst)
    }
}

impl WorkStealingPool {
    pub fn new(
        max_concurrency: usize,
        idle_timeout: Duration,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let max = max_concurrency.max(1);
        let queues = (0..max)
            .map(|_| parking_lot::Mutex::new(VecDeque::new()))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                queues,
                free_slots: parking_lot::Mutex::new((0..max).collect()),
                wake: Notify::new(),
                drained: Notify::new(),
                active_workers: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                executing: AtomicUsize::new(0),
                frozen: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_slot: AtomicUsize::new(0),
                idle_timeout,
                sink,
            }),
        }
    }

    /// Enqueue work and return immediately. Fails fast when the pool is
    /// frozen or shut down. LongRunning work bypasses the pooled workers
    /// and the concurrency bound entirely.
    pub fn submit(&self, item: WorkItem) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(QuartzError::PoolClosed);
        }
        if inner.frozen.load(Ordering::SeqCst) {
            return Err(QuartzError::PoolFrozen);
        }

        if item.priority == Priority::LongRunning {
            tokio::spawn(run_item(item));
            return Ok(());
        }

        let slot = inner.next_slot.fetch_add(1, Ordering::Relaxed) % inner.queues.len();
        // Count before pushing: a worker may pop the item the instant it
        // lands, and its decrement must never observe a zero count.
        inner.queued.fetch_add(1, Ordering::SeqCst);
        inner.queues[slot].lock().push_back(item);
        inner.wake.notify_one();
        spawn_if_needed(inner);
        Ok(())
    }

    /// Reject new submissions without touching in-flight work.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::SeqCst);
        tracing::info!("Pool frozen");
    }

    pub fn resume(&self) {
        self.inner.frozen.store(false, Ordering::SeqCst);
        tracing::info!("Pool resumed");
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn executing(&self) -> usize {
        self.inner.executing.load(Ordering::SeqCst)
    }

    /// Stop accepting work and wait for in-flight work to drain.
    /// Returns whether the drain completed within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let inner = self.inner.clone();
        inner.closed.store(true, Ordering::SeqCst);
        inner.wake.notify_waiters();

        let wait = async {
            loop {
                let drained = inner.drained.notified();
                tokio::pin!(drained);
                // Register before the check so a completion landing in
                // between is not missed.
                drained.as_mut().enable();
                if inner.total_work() == 0 {
                    return;
                }
                drained.await;
            }
        };
        let completed = tokio::time::timeout(timeout, wait).await.is_ok();
        if completed {
            tracing::info!("Pool drained");
        } else {
            tracing::warn!(
                queued = self.queued(),
                executing = self.executing(),
                "Pool drain timed out"
            );
        }
        completed
    }
}

/// Spawn a worker when queued work exists and headroom remains.
fn spawn_if_needed(inner: &Arc<PoolInner>) {
    if inner.queued.load(Ordering::SeqCst) == 0 {
        return;
    }
    let slot = {
        let mut free = inner.free_slots.lock();
        if inner.queued.load(Ordering::SeqCst) == 0 {
            return;
        }
        match free.pop() {
            Some(slot) => slot,
            None => return,
        }
    };
    let count = inner.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
    inner.sink.on_active_worker_count_changed(count);
    tracing::debug!(slot, workers = count, "Worker spawned");
    let inner = inner.clone();
    tokio::spawn(worker_loop(inner, slot));
}

async fn worker_loop(inner: Arc<PoolInner>, slot: usize) {
    loop {
        if let Some(item) = pop_local(&inner, slot).or_else(|| steal(&inner, slot)) {
            // pop_local/steal already moved the count to `executing`.
            run_item(item).await;
            inner.executing.fetch_sub(1, Ordering::SeqCst);
            inner.drained.notify_waiters();
            continue;
        }

        let woken = inner.wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();
        // Work or shutdown may have landed between the queue scan and the
        // wait registration; re-check both before parking.
        if inner.queued.load(Ordering::SeqCst) > 0 {
            continue;
        }
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = &mut woken => {}
            _ = tokio::time::sleep(inner.idle_timeout) => {
                // Never drop the active worker count to zero while work
                // remains anywhere in the pool.
                if inner.total_work() == 0
                    || inner.active_workers.load(Ordering::SeqCst) > 1
                {
                    break;
                }
            }
        }
    }
    retire(&inner, slot);
}

fn retire(inner: &Arc<PoolInner>, slot: usize) {
    {
        let mut free = inner.free_slots.lock();
        free.push(slot);
    }
    let count = inner.active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
    inner.sink.on_active_worker_count_changed(count);
    tracing::debug!(slot, workers = count, "Worker retired");
    inner.drained.notify_waiters();
    // A submission racing our exit may have missed the spawn window.
    spawn_if_needed(inner);
}

/// Pop under the queue lock, raising `executing` before `queued` drops so
/// `total_work` never reads zero while an item is in a worker's hand.
fn pop_local(inner: &PoolInner, slot: usize) -> Option<WorkItem> {
    let mut queue = inner.queues[slot].lock();
    let item = queue.pop_front();
    if item.is_some() {
        inner.executing.fetch_add(1, Ordering::SeqCst);
        inner.queued.fetch_sub(1, Ordering::SeqCst);
    }
    item
}

/// Steal one item from a randomly ordered scan of peer queues: first only
/// from queues holding more than one item, then from any non-empty queue.
fn steal(inner: &PoolInner, slot: usize) -> Option<WorkItem> {
    let mut order: Vec<usize> = (0..inner.queues.len()).filter(|&i| i != slot).collect();
    order.shuffle(&mut rand::thread_rng());

    for min_len in [2usize, 1] {
        for &peer in &order {
            let mut queue = inner.queues[peer].lock();
            if queue.len() >= min_len {
                let item = queue.pop_front();
                if item.is_some() {
                    // Same counter handoff as pop_local, under the lock.
                    inner.executing.fetch_add(1, Ordering::SeqCst);
                    inner.queued.fetch_sub(1, Ordering::SeqCst);
                    return item;
                }
            }
        }
    }
    None
}

/// Run one item, swallowing panics at the pool boundary. The job-body
/// contract requires failures to be reported through the occurrence status,
/// not through an unhandled panic, so a panicking item never takes a worker
/// down with it.
async fn run_item(item: WorkItem) {
    let queued_for = item.enqueued_at.elapsed();
    tracing::trace!(priority = ?item.priority, ?queued_for, "Running work item");
    if std::panic::AssertUnwindSafe(item.work)
        .catch_unwind()
        .await
        .is_err()
    {
        tracing::warn!("Work item panicked; swallowed at pool boundary");
    }
}

//! Pool concurrency and elasticity properties.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quartz_lite::notify::{NoopSink, NotificationSink};
use quartz_lite::pool::{WorkItem, WorkStealingPool};
use quartz_lite::registry::Priority;
use tokio_util::sync::CancellationToken;

fn normal_item(work: futures::future::BoxFuture<'static, ()>) -> WorkItem {
    WorkItem::new(Priority::Normal, CancellationToken::new(), work)
}

/// Tracks the highest number of bodies executing at once.
struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn pooled_concurrency_never_exceeds_the_bound() {
    const MAX: usize = 3;
    let pool = WorkStealingPool::new(MAX, Duration::from_millis(200), Arc::new(NoopSink));
    let probe = ConcurrencyProbe::new();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..40 {
        let probe = probe.clone();
        let done = done.clone();
        pool.submit(normal_item(Box::pin(async move {
            probe.enter();
            tokio::time::sleep(Duration::from_millis(10)).await;
            probe.exit();
            done.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    }

    assert!(pool.shutdown(Duration::from_secs(10)).await);
    assert_eq!(done.load(Ordering::SeqCst), 40);
    assert!(
        probe.peak() <= MAX,
        "peak concurrency {} exceeded bound {}",
        probe.peak(),
        MAX
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn long_running_work_is_exempt_from_the_bound() {
    const MAX: usize = 2;
    let pool = WorkStealingPool::new(MAX, Duration::from_millis(200), Arc::new(NoopSink));
    let probe = ConcurrencyProbe::new();

    // Saturate the pooled workers with slow items.
    let (hold_tx, hold_rx) = tokio::sync::watch::channel(false);
    for _ in 0..MAX {
        let mut rx = hold_rx.clone();
        pool.submit(normal_item(Box::pin(async move {
            let _ = rx.wait_for(|released| *released).await;
        })))
        .unwrap();
    }

    // All LongRunning items run concurrently despite the saturated pool.
    let started = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let probe = probe.clone();
        let started = started.clone();
        let mut rx = hold_rx.clone();
        pool.submit(WorkItem::new(
            Priority::LongRunning,
            CancellationToken::new(),
            Box::pin(async move {
                probe.enter();
                started.fetch_add(1, Ordering::SeqCst);
                let _ = rx.wait_for(|released| *released).await;
                probe.exit();
            }),
        ))
        .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while started.load(Ordering::SeqCst) < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(started.load(Ordering::SeqCst), 5);
    assert_eq!(probe.peak(), 5);

    hold_tx.send(true).unwrap();
    assert!(pool.shutdown(Duration::from_secs(10)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_drain_peer_queues_before_idling() {
    // Submissions round-robin across all four slots but workers spawn
    // lazily, so early workers must steal from slots whose worker has not
    // started yet; everything still finishes.
    let pool = WorkStealingPool::new(4, Duration::from_millis(500), Arc::new(NoopSink));
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let done = done.clone();
        pool.submit(normal_item(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            done.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    }
    assert!(pool.shutdown(Duration::from_secs(10)).await);
    assert_eq!(done.load(Ordering::SeqCst), 64);
}

#[tokio::test]
async fn worker_count_reaches_zero_when_idle() {
    let pool = WorkStealingPool::new(4, Duration::from_millis(50), Arc::new(NoopSink));
    for _ in 0..8 {
        pool.submit(normal_item(Box::pin(async {}))).unwrap();
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pool.active_workers() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pool.active_workers(), 0);
    assert_eq!(pool.queued(), 0);
}

#[tokio::test]
async fn worker_count_changes_are_reported() {
    #[derive(Default)]
    struct CountSink {
        max_seen: AtomicUsize,
        calls: AtomicUsize,
    }
    impl NotificationSink for CountSink {
        fn on_active_worker_count_changed(&self, count: usize) {
            self.max_seen.fetch_max(count, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    let sink = Arc::new(CountSink::default());
    let pool = WorkStealingPool::new(2, Duration::from_millis(100), sink.clone());
    for _ in 0..4 {
        pool.submit(normal_item(Box::pin(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
        })))
        .unwrap();
    }
    assert!(pool.shutdown(Duration::from_secs(5)).await);
    assert!(sink.calls.load(Ordering::SeqCst) >= 1);
    assert!(sink.max_seen.load(Ordering::SeqCst) <= 2);
}

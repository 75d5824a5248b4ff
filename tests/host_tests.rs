//! End-to-end host behavior against the in-memory backend.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quartz_lite::registry::{JobDefinition, JobRegistry, Priority, RetryPolicy};
use quartz_lite::scheduler::occurrence::{Occurrence, OccurrenceStatus};
use quartz_lite::store::OccurrenceStore;
use test_harness::{build_host, counting_job, failing_job, wait_for, RecordingStore};
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cron_occurrence_runs_through_the_full_lifecycle() {
    let mut registry = JobRegistry::new();
    let runs = Arc::new(AtomicUsize::new(0));
    registry
        .register(
            JobDefinition::recurring(
                "every-second",
                "* * * * * *",
                Priority::Normal,
                counting_job(runs.clone()),
            )
            .unwrap(),
        )
        .unwrap();

    let store = Arc::new(RecordingStore::new());
    let host = build_host("node-1", registry, store.clone());
    host.start().unwrap();
    assert!(host.is_running());

    assert!(
        wait_for(Duration::from_secs(5), || {
            let runs = runs.clone();
            async move { runs.load(Ordering::SeqCst) >= 1 }
        })
        .await,
        "cron occurrence should run within its first firing window"
    );

    // Find a completed occurrence and check the observed transition order.
    let done = wait_for(Duration::from_secs(2), || {
        let store = store.clone();
        async move {
            store
                .store()
                .all()
                .await
                .iter()
                .any(|o| o.status == OccurrenceStatus::Done)
        }
    })
    .await;
    assert!(done);

    let all = store.store().all().await;
    let finished = all
        .iter()
        .find(|o| o.status == OccurrenceStatus::Done)
        .expect("a Done occurrence exists");
    assert_eq!(
        store.transitions_for(finished.id),
        vec![
            OccurrenceStatus::Idle,
            OccurrenceStatus::Queued,
            OccurrenceStatus::InProgress,
            OccurrenceStatus::Done,
        ],
        "lease transitions must be observed in order"
    );
    assert_eq!(finished.lock_holder, None);
    assert!(finished.elapsed_ms.is_some());

    host.stop().await;
    assert!(!host.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_shot_wakes_the_sleeping_loop() {
    let mut registry = JobRegistry::new();
    let runs = Arc::new(AtomicUsize::new(0));
    registry
        .register(JobDefinition::one_shot(
            "manual",
            Priority::Normal,
            counting_job(runs.clone()),
        ))
        .unwrap();

    let store = Arc::new(RecordingStore::new());
    let host = build_host("node-1", registry, store);
    host.start().unwrap();

    // No recurring jobs: the loop is parked on its bounded "forever" sleep.
    tokio::time::sleep(Duration::from_millis(100)).await;
    host.schedule_once("manual", Utc::now(), None).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(3), || {
            let runs = runs.clone();
            async move { runs.load(Ordering::SeqCst) == 1 }
        })
        .await,
        "restart signal should cut the armed sleep short"
    );
    host.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scheduling_unknown_function_is_rejected() {
    let registry = JobRegistry::new();
    let store = Arc::new(RecordingStore::new());
    let host = build_host("node-1", registry, store);
    let err = host
        .schedule_once("nobody-home", Utc::now(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        quartz_lite::QuartzError::FunctionNotFound(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_occurrence_retries_until_budget_exhausted() {
    let mut registry = JobRegistry::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    registry
        .register(
            JobDefinition::one_shot("flaky", Priority::Normal, failing_job(attempts.clone()))
                .with_retry(RetryPolicy::new(2, vec![Duration::from_millis(50)])),
        )
        .unwrap();

    let store = Arc::new(RecordingStore::new());
    let host = build_host("node-1", registry, store.clone());
    host.start().unwrap();
    host.schedule_once("flaky", Utc::now(), None).await.unwrap();

    // Retry budget 2 means 3 total failures: the first run plus 2 retries.
    assert!(
        wait_for(Duration::from_secs(5), || {
            let attempts = attempts.clone();
            async move { attempts.load(Ordering::SeqCst) == 3 }
        })
        .await
    );

    // No further re-materialization once the budget is spent.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(!store.store().has_pending("flaky").await.unwrap());

    let all = store.store().all().await;
    let failed: Vec<_> = all
        .iter()
        .filter(|o| o.status == OccurrenceStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 3);
    assert!(failed.iter().all(|o| o.last_error.is_some()));
    let max_retry = failed.iter().map(|o| o.retry_count).max().unwrap();
    assert_eq!(max_retry, 2);

    host.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_occurrence_can_be_cancelled_by_id() {
    let mut registry = JobRegistry::new();
    let finished = Arc::new(AtomicUsize::new(0));
    let finished_clone = finished.clone();
    registry
        .register(JobDefinition::one_shot(
            "sleepy",
            Priority::Normal,
            Arc::new(move |_ctx, _token| {
                let finished = finished_clone.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        ))
        .unwrap();

    let store = Arc::new(RecordingStore::new());
    let host = build_host("node-1", registry, store.clone());
    host.start().unwrap();
    let id = host.schedule_once("sleepy", Utc::now(), None).await.unwrap();

    // Wait until the body is actually running.
    assert!(
        wait_for(Duration::from_secs(3), || {
            let store = store.clone();
            async move {
                store
                    .get(id)
                    .await
                    .unwrap()
                    .is_some_and(|o| o.status == OccurrenceStatus::InProgress)
            }
        })
        .await
    );

    assert!(host.request_cancellation(id).await);
    assert!(
        wait_for(Duration::from_secs(3), || {
            let store = store.clone();
            async move {
                store
                    .get(id)
                    .await
                    .unwrap()
                    .is_some_and(|o| o.status == OccurrenceStatus::Cancelled)
            }
        })
        .await
    );
    assert_eq!(finished.load(Ordering::SeqCst), 0, "body must not complete");

    // Unknown ids are a safe no-op.
    assert!(!host.request_cancellation(Uuid::new_v4()).await);

    host.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_dispatch_follows_priority_order() {
    let mut registry = JobRegistry::new();
    let order = Arc::new(parking_lot::Mutex::new(Vec::<&'static str>::new()));
    for (name, priority) in [("high-job", Priority::High), ("normal-job", Priority::Normal)] {
        let order = order.clone();
        registry
            .register(JobDefinition::one_shot(
                name,
                priority,
                Arc::new(move |ctx, _token| {
                    let order = order.clone();
                    let tag: &'static str = if ctx.function_name == "high-job" {
                        "high"
                    } else {
                        "normal"
                    };
                    Box::pin(async move {
                        order.lock().push(tag);
                        Ok(())
                    })
                }),
            ))
            .unwrap();
    }

    let store = Arc::new(RecordingStore::new());
    let mut config = test_harness::test_config("node-1");
    config.max_concurrency = 1; // single worker serializes execution order
    let host = quartz_lite::SchedulerHost::new(
        config,
        Arc::new(registry),
        store.clone(),
        Arc::new(quartz_lite::NoopSink),
    );

    // Same scheduled instant, so both land in one due-set batch.
    let at = Utc::now() + chrono::Duration::milliseconds(300);
    let high = Occurrence::new_one_shot("high-job", at);
    let normal = Occurrence::new_one_shot("normal-job", at);
    store.insert(high).await.unwrap();
    store.insert(normal).await.unwrap();

    host.start().unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || {
            let order = order.clone();
            async move { order.lock().len() == 2 }
        })
        .await
    );
    assert_eq!(*order.lock(), vec!["normal", "high"], "lower class dispatches first");
    host.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_releases_leases_and_double_start_errors() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::one_shot(
            "noop",
            Priority::Normal,
            counting_job(Arc::new(AtomicUsize::new(0))),
        ))
        .unwrap();
    let store = Arc::new(RecordingStore::new());
    let host = build_host("node-1", registry, store);

    host.start().unwrap();
    assert!(matches!(
        host.start().unwrap_err(),
        quartz_lite::QuartzError::AlreadyRunning
    ));
    host.stop().await;
    assert!(!host.is_running());

    // Restart works after a clean stop.
    host.start().unwrap();
    host.stop().await;
}

//! End-to-end admission scenarios on a live tokio runtime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use callgate::gate::{AdmissionGate, ManualScheduler, RateLimitConfig, ReleasePolicy};
use callgate::{CallgateError, GateError};

/// Tracks how many actions are running at once.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_third_caller_waits_for_release() {
    let gate = Arc::new(AdmissionGate::new(Duration::from_secs(1), 2).unwrap());
    let tracker = Arc::new(Concurrency::default());
    let started = Instant::now();

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let gate = Arc::clone(&gate);
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                gate.acquire_and_run(|| async {
                    tracker.enter();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    tracker.exit();
                    Ok::<_, ()>(i)
                })
                .await
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        assert!(result.unwrap().is_ok());
    }

    // Released by completion, not by the one-second window.
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(tracker.peak.load(Ordering::SeqCst) <= 2);

    let stats = gate.stats();
    assert_eq!(stats.total_admitted, 3);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.windows_elapsed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resets_do_not_free_a_busy_slot() {
    let gate = Arc::new(AdmissionGate::new(Duration::from_millis(50), 1).unwrap());
    let first_done = Arc::new(AtomicBool::new(false));

    let first = {
        let gate = Arc::clone(&gate);
        let first_done = Arc::clone(&first_done);
        tokio::spawn(async move {
            gate.acquire_and_run(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                first_done.store(true, Ordering::SeqCst);
                Ok::<_, ()>(())
            })
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = {
        let gate = Arc::clone(&gate);
        let first_done = Arc::clone(&first_done);
        tokio::spawn(async move {
            gate.acquire_and_run(|| async move { Ok::<_, ()>(first_done.load(Ordering::SeqCst)) })
                .await
        })
    };

    assert!(first.await.unwrap().is_ok());
    let saw_first_done = second.await.unwrap().unwrap();
    assert!(saw_first_done, "second caller ran before the first released");
    assert!(gate.stats().windows_elapsed >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_slot_race_completes() {
    let gate = Arc::new(AdmissionGate::new(Duration::from_millis(100), 1).unwrap());

    let racers: Vec<_> = (0..2)
        .map(|i| {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.acquire_and_run(|| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, ()>(i)
                })
                .await
            })
        })
        .collect();

    let finished = tokio::time::timeout(
        Duration::from_secs(2),
        futures::future::join_all(racers),
    )
    .await
    .expect("callers deadlocked");

    let mut ids: Vec<_> = finished.into_iter().map(|r| r.unwrap().unwrap()).collect();
    ids.sort();
    assert_eq!(ids, vec![0, 1]);
}

#[tokio::test]
async fn test_window_policy_caps_admissions_per_window() {
    let scheduler = ManualScheduler::new();
    let config = RateLimitConfig::new(Duration::from_secs(1), 2)
        .unwrap()
        .with_release(ReleasePolicy::AtWindowEnd);
    let gate = Arc::new(AdmissionGate::with_scheduler(config, &scheduler));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire_and_run(|| async { Ok::<_, ()>(()) }).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = gate.stats();
    assert_eq!(stats.admitted_in_window, 2);
    assert_eq!(stats.total_admitted, 2);
    assert_eq!(stats.waiting, 3);

    scheduler.tick();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gate.stats().total_admitted, 4);
    assert_eq!(gate.stats().admitted_in_window, 2);

    scheduler.tick();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gate.stats().total_admitted, 5);
    assert_eq!(gate.stats().admitted_in_window, 1);

    for result in futures::future::join_all(handles).await {
        assert!(result.unwrap().is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_window_policy_spreads_calls_over_windows() {
    let config = RateLimitConfig::new(Duration::from_millis(100), 2)
        .unwrap()
        .with_release(ReleasePolicy::AtWindowEnd);
    let gate = Arc::new(AdmissionGate::with_config(config).unwrap());
    let started = Instant::now();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire_and_run(|| async { Ok::<_, ()>(()) }).await })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        assert!(result.unwrap().is_ok());
    }

    // Two per window: the last pair waits for the second reset.
    assert!(started.elapsed() >= Duration::from_millis(180));
}

#[tokio::test]
async fn test_action_error_is_returned_and_slot_released() {
    let gate = AdmissionGate::new(Duration::from_secs(1), 1).unwrap();

    let err = gate
        .acquire_and_run(|| async {
            Err::<(), _>(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "downstream unavailable",
            ))
        })
        .await
        .unwrap_err();

    let inner = err.into_action_error().expect("expected the action's error");
    assert_eq!(inner.kind(), std::io::ErrorKind::ConnectionRefused);
    assert_eq!(inner.to_string(), "downstream unavailable");

    let next = tokio::time::timeout(
        Duration::from_millis(100),
        gate.acquire_and_run(|| async { Ok::<_, std::io::Error>("accepted") }),
    )
    .await
    .expect("slot was not released after the failure");
    assert_eq!(next.unwrap(), "accepted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_releases_all_waiters() {
    let gate = Arc::new(AdmissionGate::new(Duration::from_secs(60), 1).unwrap());

    let holder = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            gate.acquire_and_run(|| async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok::<_, ()>("held")
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire_and_run(|| async { Ok::<_, ()>("late") }).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gate.stats().waiting, 3);

    gate.shutdown();
    gate.shutdown();

    let refused = tokio::time::timeout(
        Duration::from_millis(100),
        futures::future::join_all(waiters),
    )
    .await
    .expect("waiters stayed blocked after shutdown");
    for result in refused {
        assert_eq!(result.unwrap(), Err(GateError::Closed));
    }

    assert_eq!(holder.await.unwrap(), Ok("held"));
    let stats = gate.stats();
    assert!(stats.closed);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.waiting, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timed_out_caller_leaves_no_trace() {
    let gate = Arc::new(AdmissionGate::new(Duration::from_secs(60), 1).unwrap());

    let holder = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            gate.acquire_and_run(|| async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok::<_, ()>(())
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let timed_out = tokio::time::timeout(
        Duration::from_millis(30),
        gate.acquire_and_run(|| async { Ok::<_, ()>(()) }),
    )
    .await;
    assert!(timed_out.is_err());

    let stats = gate.stats();
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.total_admitted, 1);

    holder.await.unwrap().unwrap();
    assert!(gate.try_acquire().unwrap().is_some());
}

#[tokio::test]
async fn test_cancelled_action_releases_slot() {
    let gate = AdmissionGate::new(Duration::from_secs(60), 1).unwrap();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        gate.acquire_and_run(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, ()>(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    assert_eq!(gate.stats().in_flight, 0);
    assert!(gate.try_acquire().unwrap().is_some());
}

#[tokio::test]
async fn test_invalid_construction() {
    assert!(matches!(
        AdmissionGate::new(Duration::from_secs(1), 0),
        Err(CallgateError::InvalidConfig(_))
    ));
    assert!(matches!(
        AdmissionGate::new(Duration::ZERO, 3),
        Err(CallgateError::InvalidConfig(_))
    ));
}

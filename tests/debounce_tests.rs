use anyhow::{Result, anyhow};
use futures_util::future::BoxFuture;
use notification_dispatch::{
    DispatchError,
    clients::debounce::{DebounceCoordinator, PendingCall, Submission},
    models::listener::DebounceConfig,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{Instant, sleep};

type CallLog = Arc<Mutex<Vec<(u32, Instant)>>>;

fn recording_call(log: &CallLog, arg: u32) -> PendingCall {
    let log = Arc::clone(log);
    Box::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            log.lock().unwrap().push((arg, Instant::now()));
            Ok(())
        })
    })
}

fn calls(log: &CallLog) -> Vec<(u32, Instant)> {
    log.lock().unwrap().clone()
}

/// Test: A burst of calls fires once, with the last argument, waitFor after the last call
#[tokio::test(start_paused = true)]
async fn test_burst_collapses_to_last_call() -> Result<()> {
    let coordinator = DebounceCoordinator::new();
    let config = DebounceConfig::new(500, 5000);
    let log: CallLog = Arc::default();

    let mut last_call = Instant::now();
    for arg in 1..=10 {
        last_call = Instant::now();
        let submission = coordinator.submit("k".to_string(), config, recording_call(&log, arg));

        if arg == 1 {
            assert_eq!(submission, Submission::Scheduled);
        } else {
            assert_eq!(submission, Submission::Coalesced);
        }

        if arg < 10 {
            sleep(Duration::from_millis(100)).await;
        }
    }

    assert_eq!(coordinator.pending(), 1);
    sleep(Duration::from_millis(1000)).await;

    let fired = calls(&log);
    assert_eq!(fired.len(), 1, "Burst should collapse to one invocation");

    let (arg, at) = fired[0];
    assert_eq!(arg, 10, "Only the most recent arguments survive");
    assert_eq!(at.duration_since(last_call), Duration::from_millis(500));
    assert_eq!(coordinator.pending(), 0);

    Ok(())
}

/// Test: A continuous stream fires at maxWaitFor, then again after it stops
#[tokio::test(start_paused = true)]
async fn test_max_wait_bounds_continuous_stream() -> Result<()> {
    let coordinator = DebounceCoordinator::new();
    let config = DebounceConfig::new(500, 2000);
    let log: CallLog = Arc::default();

    let start = Instant::now();
    for arg in 0..30 {
        coordinator.submit("k".to_string(), config, recording_call(&log, arg));
        sleep(Duration::from_millis(100)).await;
    }

    sleep(Duration::from_millis(1000)).await;

    let fired = calls(&log);
    assert_eq!(fired.len(), 2, "Expected one forced fire and one trailing fire");

    let (first_arg, first_at) = fired[0];
    assert_eq!(first_at.duration_since(start), Duration::from_millis(2000));
    // The call due at t=2000 races the deadline; either side of it is correct.
    assert!(
        first_arg == 19 || first_arg == 20,
        "Forced fire should carry the latest call so far (got {})",
        first_arg
    );

    let (second_arg, second_at) = fired[1];
    assert_eq!(second_arg, 29);
    assert_eq!(second_at.duration_since(start), Duration::from_millis(3400));

    Ok(())
}

/// Test: Keys are debounced independently
#[tokio::test(start_paused = true)]
async fn test_keys_are_independent() -> Result<()> {
    let coordinator = DebounceCoordinator::new();
    let config = DebounceConfig::new(200, 1000);
    let log: CallLog = Arc::default();

    coordinator.submit("a".to_string(), config, recording_call(&log, 1));
    coordinator.submit("b".to_string(), config, recording_call(&log, 2));
    coordinator.submit("a".to_string(), config, recording_call(&log, 3));

    assert_eq!(coordinator.pending(), 2);
    sleep(Duration::from_millis(500)).await;

    let mut args: Vec<u32> = calls(&log).into_iter().map(|(arg, _)| arg).collect();
    args.sort_unstable();
    assert_eq!(args, vec![2, 3]);

    Ok(())
}

/// Test: A new window opens after the previous one fired
#[tokio::test(start_paused = true)]
async fn test_new_window_after_fire() -> Result<()> {
    let coordinator = DebounceCoordinator::new();
    let config = DebounceConfig::new(100, 1000);
    let log: CallLog = Arc::default();

    assert_eq!(
        coordinator.submit("k".to_string(), config, recording_call(&log, 1)),
        Submission::Scheduled
    );
    sleep(Duration::from_millis(300)).await;

    assert_eq!(
        coordinator.submit("k".to_string(), config, recording_call(&log, 2)),
        Submission::Scheduled
    );
    sleep(Duration::from_millis(300)).await;

    let args: Vec<u32> = calls(&log).into_iter().map(|(arg, _)| arg).collect();
    assert_eq!(args, vec![1, 2]);

    Ok(())
}

/// Test: A failing debounced handler is logged and does not wedge the key
#[tokio::test(start_paused = true)]
async fn test_failed_fire_does_not_block_key() -> Result<()> {
    let coordinator = DebounceCoordinator::new();
    let config = DebounceConfig::new(100, 1000);
    let log: CallLog = Arc::default();

    coordinator.submit(
        "k".to_string(),
        config,
        Box::new(|| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async { Err(anyhow!("handler exploded")) })
        }),
    );
    sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.pending(), 0);

    coordinator.submit("k".to_string(), config, recording_call(&log, 7));
    sleep(Duration::from_millis(300)).await;

    assert_eq!(calls(&log).len(), 1);

    Ok(())
}

/// Test: Drain fires pending entries right away and later calls run immediately
#[tokio::test(start_paused = true)]
async fn test_drain_fires_pending_entries() -> Result<()> {
    let coordinator = DebounceCoordinator::new();
    let config = DebounceConfig::new(5000, 60_000);
    let log: CallLog = Arc::default();

    let start = Instant::now();
    coordinator.submit("a".to_string(), config, recording_call(&log, 1));
    coordinator.submit("b".to_string(), config, recording_call(&log, 2));

    coordinator.drain(Duration::from_secs(1)).await?;

    let fired = calls(&log);
    assert_eq!(fired.len(), 2);
    assert!(
        fired.iter().all(|(_, at)| at.duration_since(start) < Duration::from_secs(1)),
        "Drain should not wait for the debounce windows"
    );
    assert_eq!(coordinator.pending(), 0);

    let submission = coordinator.submit("a".to_string(), config, recording_call(&log, 3));
    assert_eq!(submission, Submission::Immediate);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(calls(&log).len(), 3);

    Ok(())
}

/// Test: Drain reports handlers still running when the grace period ends
#[tokio::test(start_paused = true)]
async fn test_drain_times_out_on_slow_handler() -> Result<()> {
    let coordinator = DebounceCoordinator::new();
    let config = DebounceConfig::new(100, 1000);

    coordinator.submit(
        "slow".to_string(),
        config,
        Box::new(|| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async {
                sleep(Duration::from_secs(30)).await;
                Ok(())
            })
        }),
    );

    let result = coordinator.drain(Duration::from_secs(1)).await;

    match result {
        Err(DispatchError::DebounceDrainTimeout { pending }) => assert_eq!(pending, 1),
        other => panic!("Expected drain timeout, got {:?}", other),
    }

    Ok(())
}

fn panicking_call() -> PendingCall {
    Box::new(|| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async { panic!("handler bug") })
    })
}

/// Test: A panicking debounced handler is contained when its window closes
#[tokio::test(start_paused = true)]
async fn test_panicking_fire_does_not_block_key() -> Result<()> {
    let coordinator = DebounceCoordinator::new();
    let config = DebounceConfig::new(100, 1000);
    let log: CallLog = Arc::default();

    coordinator.submit("k".to_string(), config, panicking_call());
    sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.pending(), 0);

    coordinator.submit("k".to_string(), config, recording_call(&log, 7));
    sleep(Duration::from_millis(300)).await;
    assert_eq!(calls(&log).len(), 1);

    coordinator.drain(Duration::from_secs(1)).await?;

    Ok(())
}

/// Test: Drain completes when a pending handler panics and still runs the others
#[tokio::test(start_paused = true)]
async fn test_drain_survives_panicking_handler() -> Result<()> {
    let coordinator = DebounceCoordinator::new();
    let config = DebounceConfig::new(5000, 60_000);
    let log: CallLog = Arc::default();

    coordinator.submit("bad".to_string(), config, panicking_call());
    coordinator.submit("good".to_string(), config, recording_call(&log, 1));

    let drain = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.drain(Duration::from_secs(1)).await }
    });

    let result = drain.await?;
    assert!(result.is_ok(), "Drain should succeed, got {:?}", result);
    assert_eq!(calls(&log).len(), 1);

    // Nothing is left counted as in flight after the panic.
    let submission = coordinator.submit("late".to_string(), config, panicking_call());
    assert_eq!(submission, Submission::Immediate);
    sleep(Duration::from_millis(10)).await;

    coordinator.submit(
        "slow".to_string(),
        config,
        Box::new(|| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async {
                sleep(Duration::from_secs(30)).await;
                Ok(())
            })
        }),
    );

    match coordinator.drain(Duration::from_millis(100)).await {
        Err(DispatchError::DebounceDrainTimeout { pending }) => assert_eq!(pending, 1),
        other => panic!("Expected drain timeout, got {:?}", other),
    }

    Ok(())
}

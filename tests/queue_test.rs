//! Broker-backed tests. They start a RabbitMQ container, so they need Docker:
//! `cargo test --test queue_test -- --ignored`.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use lapin::{
    options::{BasicGetOptions, QueueDeclareOptions},
    types::FieldTable,
};
use notification_dispatch::{
    Config, DispatchError, Dispatcher, ListenerContext, ListenerRegistry, ListenerSpec,
    Notification, RetryPolicy, TopologyManager,
    clients::rbmq::RabbitMqClient,
    models::{envelope::Envelope, listener::ListenerDescriptor},
};
use serde::{Deserialize, Serialize};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep, timeout},
};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StandardNotification {
    body: String,
}

impl Notification for StandardNotification {
    const TYPE_NAME: &'static str = "StandardNotification";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailingNotification {
    body: String,
}

impl Notification for FailingNotification {
    const TYPE_NAME: &'static str = "FailingNotification";
    const RETRY_POLICY: Option<RetryPolicy> = Some(RetryPolicy::new(3, 100, 2.0, 1000));
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConcurrentNotification {
    index: u32,
}

impl Notification for ConcurrentNotification {
    const TYPE_NAME: &'static str = "ConcurrentNotification";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DelayedNotification {
    body: String,
}

impl Notification for DelayedNotification {
    const TYPE_NAME: &'static str = "DelayedNotification";
    const DELAY_MS: Option<u64> = Some(3000);
}

async fn start_rabbitmq() -> Result<(ContainerAsync<GenericImage>, String)> {
    let container = GenericImage::new("rabbitmq", "3.13-alpine")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"))
        .with_startup_timeout(Duration::from_secs(120))
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5672.tcp()).await?;

    Ok((container, format!("amqp://guest:guest@{}:{}/%2f", host, port)))
}

/// Fresh prefix per test so reruns against one broker never share queues.
fn test_config(uri: &str) -> Config {
    let mut config = Config::with_uri(uri);
    config.broker_name_prefix = format!("t{}.", Uuid::new_v4().simple());
    config.shutdown_grace_ms = 2000;
    config
}

async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, limit: Duration) -> Result<T> {
    timeout(limit, rx.recv())
        .await
        .map_err(|_| anyhow!("Timed out after {:?}", limit))?
        .ok_or_else(|| anyhow!("Channel closed"))
}

/// Test: One publish reaches every listener of the type exactly once
#[tokio::test]
#[ignore = "requires docker"]
async fn test_publish_fans_out_to_every_listener() -> Result<()> {
    let (_container, uri) = start_rabbitmq().await?;
    let config = test_config(&uri);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registry = ListenerRegistry::new(&config);
    registry.register(ListenerSpec::named(
        ["a", "b"],
        move |n: StandardNotification, ctx: ListenerContext| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((ctx.listener_name, ctx.attempt, n.body));
                Ok(())
            }
        },
    ))?;

    let handle = Dispatcher::start(&config, registry).await?;
    handle
        .publisher()
        .publish(&StandardNotification {
            body: "hello".to_string(),
        })
        .await?;

    let mut listeners = HashSet::new();
    for _ in 0..2 {
        let (listener, attempt, body) = recv_within(&mut rx, Duration::from_secs(5)).await?;
        assert_eq!(attempt, 0);
        assert_eq!(body, "hello");
        listeners.insert(listener);
    }

    assert_eq!(listeners, HashSet::from(["a".to_string(), "b".to_string()]));
    assert!(
        timeout(Duration::from_millis(500), rx.recv()).await.is_err(),
        "No listener should see the notification twice"
    );

    handle.shutdown().await?;
    Ok(())
}

/// Test: A failing handler is retried with growing delays, then dead-lettered
#[tokio::test]
#[ignore = "requires docker"]
async fn test_failing_handler_is_dead_lettered() -> Result<()> {
    let (_container, uri) = start_rabbitmq().await?;
    let config = test_config(&uri);

    let invocations = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&invocations);

    let mut registry = ListenerRegistry::new(&config);
    registry.register(ListenerSpec::new(
        "failing",
        move |_: FailingNotification, ctx: ListenerContext| {
            let record = Arc::clone(&record);
            async move {
                record.lock().unwrap().push((ctx.attempt, Instant::now()));
                Err(anyhow!("attempt {} failed", ctx.attempt))
            }
        },
    ))?;

    let handle = Dispatcher::start(&config, registry).await?;
    handle
        .publisher()
        .publish(&FailingNotification {
            body: "doomed".to_string(),
        })
        .await?;

    let client = RabbitMqClient::try_connect(&config).await?;
    let channel = client.channel().await?;
    let dead_queue = format!(
        "{}dead.FailingNotification#failing",
        config.broker_name_prefix
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    let dead = loop {
        if let Some(message) = channel
            .basic_get(dead_queue.as_str().into(), BasicGetOptions { no_ack: true })
            .await?
        {
            break message;
        }
        if Instant::now() > deadline {
            return Err(anyhow!("Nothing reached {}", dead_queue));
        }
        sleep(Duration::from_millis(100)).await;
    };

    let envelope = Envelope::from_headers(
        dead.delivery.properties.headers().as_ref(),
        "unknown",
        0,
    );
    assert_eq!(envelope.attempt, 3);
    assert_eq!(envelope.last_error.as_deref(), Some("attempt 2 failed"));

    let invocations = invocations.lock().unwrap().clone();
    let attempts: Vec<u32> = invocations.iter().map(|(attempt, _)| *attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);

    let first_gap = invocations[1].1.duration_since(invocations[0].1);
    let second_gap = invocations[2].1.duration_since(invocations[1].1);
    assert!(first_gap >= Duration::from_millis(90), "first gap {:?}", first_gap);
    assert!(second_gap >= Duration::from_millis(190), "second gap {:?}", second_gap);

    client.close().await;
    handle.shutdown().await?;
    Ok(())
}

/// Test: No more than `concurrency` handlers run at once for one listener
#[tokio::test]
#[ignore = "requires docker"]
async fn test_concurrency_ceiling() -> Result<()> {
    let (_container, uri) = start_rabbitmq().await?;
    let config = test_config(&uri);

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let (flight, top, finished) = (Arc::clone(&in_flight), Arc::clone(&peak), Arc::clone(&done));
    let mut registry = ListenerRegistry::new(&config);
    registry.register(
        ListenerSpec::new(
            "worker",
            move |_: ConcurrentNotification, _: ListenerContext| {
                let (flight, top, finished) =
                    (Arc::clone(&flight), Arc::clone(&top), Arc::clone(&finished));
                async move {
                    let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                    top.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    flight.fetch_sub(1, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .concurrency(2),
    )?;

    let handle = Dispatcher::start(&config, registry).await?;
    let publisher = handle.publisher();
    for index in 0..30 {
        publisher.publish(&ConcurrentNotification { index }).await?;
    }

    let deadline = Instant::now() + Duration::from_secs(15);
    while done.load(Ordering::SeqCst) < 30 {
        if Instant::now() > deadline {
            return Err(anyhow!("Only {} of 30 handled", done.load(Ordering::SeqCst)));
        }
        sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);

    handle.shutdown().await?;
    Ok(())
}

/// Test: A type with a static delay is not delivered before the delay elapses
#[tokio::test]
#[ignore = "requires docker"]
async fn test_static_delay() -> Result<()> {
    let (_container, uri) = start_rabbitmq().await?;
    let config = test_config(&uri);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registry = ListenerRegistry::new(&config);
    registry.register(ListenerSpec::new(
        "later",
        move |_: DelayedNotification, ctx: ListenerContext| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((Instant::now(), ctx.delay_ms));
                Ok(())
            }
        },
    ))?;

    let handle = Dispatcher::start(&config, registry).await?;

    let published_at = Instant::now();
    handle
        .publisher()
        .publish(&DelayedNotification {
            body: "eventually".to_string(),
        })
        .await?;

    let (received_at, delay_ms) = recv_within(&mut rx, Duration::from_secs(10)).await?;

    assert!(
        received_at.duration_since(published_at) >= Duration::from_millis(2950),
        "Delivered after {:?}",
        received_at.duration_since(published_at)
    );
    assert_eq!(delay_ms, Some(3000));

    handle.shutdown().await?;
    Ok(())
}

/// Test: Provisioning twice succeeds, a mismatched existing queue does not
#[tokio::test]
#[ignore = "requires docker"]
async fn test_topology_idempotence_and_conflict() -> Result<()> {
    let (_container, uri) = start_rabbitmq().await?;
    let config = test_config(&uri);

    let client = Arc::new(RabbitMqClient::try_connect(&config).await?);
    let topology = TopologyManager::new(Arc::clone(&client), &config);

    let listeners = [ListenerDescriptor {
        notification_type: "StandardNotification".to_string(),
        listener_name: "email".to_string(),
        concurrency: 1,
        retry_policy: RetryPolicy::default(),
        debounce: None,
    }];

    topology.ensure_topology(&listeners).await?;
    topology.ensure_topology(&listeners).await?;

    // Same working queue name, but without the dead-letter arguments.
    let channel = client.channel().await?;
    channel
        .queue_declare(
            format!("{}StandardNotification#sms", config.broker_name_prefix)
                .as_str()
                .into(),
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let conflicting = [ListenerDescriptor {
        listener_name: "sms".to_string(),
        ..listeners[0].clone()
    }];

    let result = topology.ensure_topology(&conflicting).await;
    assert!(
        matches!(result, Err(DispatchError::TopologyConflict { .. })),
        "Expected topology conflict, got {:?}",
        result
    );

    client.close().await;
    Ok(())
}

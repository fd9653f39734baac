//! Per-listener workers and the retry / dead-letter state machine.
//!
//! A message moves `LIVE -> HANDLED`, `LIVE -> RETRYING -> LIVE`, or
//! `LIVE -> DEAD`. The only state is the envelope carried on the message; the
//! attempt counter is bumped when republishing, never on receive, so a plain
//! broker redelivery keeps its attempt number.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::{FutureExt, StreamExt};
use lapin::{
    BasicProperties, Channel,
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions},
    types::FieldTable,
};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clients::{
        debounce::DebounceCoordinator, publisher::publish_confirmed, rbmq::RabbitMqClient,
        registry::RegisteredListener, topology::TopologyNames,
    },
    error::{DispatchError, Result},
    models::{envelope::Envelope, retry::RetryPolicy},
    utils::{now_millis, reconnect_delay},
};

/// What to do with a delivery once the handler has had its say.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack,
    Retry { envelope: Envelope, ttl_ms: u64 },
    Dead { envelope: Envelope },
}

/// Next step after a failed attempt. A payload that cannot be decoded gets
/// one retry at most; the second decode failure goes straight to the dead queue.
pub fn failure_disposition(
    envelope: &Envelope,
    policy: &RetryPolicy,
    error: &str,
    decode_failure: bool,
    now_ms: i64,
) -> Disposition {
    let next = envelope.after_failure(error, now_ms);

    let retryable = policy.allows_retry(next.attempt) && !(decode_failure && envelope.attempt > 0);

    if retryable {
        Disposition::Retry {
            ttl_ms: policy.delay_for(next.attempt),
            envelope: next,
        }
    } else {
        Disposition::Dead { envelope: next }
    }
}

/// How the original delivery is settled once its copy was republished to the
/// retry or dead queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The copy is safely on its next queue.
    Ack,
    /// The copy may not exist; put the original back unchanged.
    Requeue,
}

pub fn settle_forwarded(republished: &Result<()>) -> Settlement {
    match republished {
        Ok(()) => Settlement::Ack,
        Err(_) => Settlement::Requeue,
    }
}

/// Runs the listener's handler for one delivery, or hands it to the debounce
/// coordinator, and decides the delivery's fate. Never fails: decode errors,
/// handler errors and handler panics all become a retry or dead disposition.
pub async fn evaluate_delivery(
    listener: &RegisteredListener,
    body: &[u8],
    envelope: &Envelope,
    debounce: &DebounceCoordinator,
) -> Disposition {
    let descriptor = listener.descriptor();

    let prepared = match listener.prepare(body, listener.context(envelope)) {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(
                notification_type = %descriptor.notification_type,
                listener = %descriptor.listener_name,
                attempt = envelope.attempt,
                error = %e,
                "Failed to decode notification"
            );
            return failure_disposition(
                envelope,
                &descriptor.retry_policy,
                &e.to_string(),
                true,
                now_millis(),
            );
        }
    };

    if let (Some(key), Some(config)) = (prepared.debounce_key, descriptor.debounce) {
        debounce.submit(key, config, prepared.call);
        return Disposition::Ack;
    }

    let call = prepared.call;
    let outcome = AssertUnwindSafe(async move { call().await })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(DispatchError::Handler(panic_message(panic.as_ref())).into()));

    match outcome {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            warn!(
                notification_type = %descriptor.notification_type,
                listener = %descriptor.listener_name,
                attempt = envelope.attempt,
                first_seen = envelope.first_seen_ms,
                original_routing = %envelope.original_routing,
                delay_ms = ?envelope.delay_ms,
                error = %e,
                "Handler failed"
            );
            failure_disposition(
                envelope,
                &descriptor.retry_policy,
                &format!("{:#}", e),
                false,
                now_millis(),
            )
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

/// Counters shared by every worker, read by the health check.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub expected: AtomicUsize,
    pub running: AtomicUsize,
    pub acked: AtomicU64,
    pub retried: AtomicU64,
    pub dead: AtomicU64,
    pub requeued: AtomicU64,
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Back-off between worker restarts. Reset once a consumer is running again
/// so an earlier outage does not stretch the next restart.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    policy: RetryPolicy,
    failures: u32,
}

impl RestartBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure and returns how long to wait before restarting.
    pub fn next_delay(&mut self) -> Duration {
        self.failures += 1;
        reconnect_delay(&self.policy, self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Drives `concurrency` workers for one listener queue. Each worker owns one
/// channel with prefetch 1, so at most `concurrency` handlers run at once.
pub struct ListenerConsumer {
    listener: RegisteredListener,
    client: Arc<RabbitMqClient>,
    names: TopologyNames,
    debounce: DebounceCoordinator,
    confirm_timeout: Duration,
    shutdown: CancellationToken,
    stats: Arc<WorkerStats>,
}

impl ListenerConsumer {
    pub fn new(
        listener: RegisteredListener,
        client: Arc<RabbitMqClient>,
        names: TopologyNames,
        debounce: DebounceCoordinator,
        confirm_timeout: Duration,
        shutdown: CancellationToken,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            listener,
            client,
            names,
            debounce,
            confirm_timeout,
            shutdown,
            stats,
        }
    }

    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.listener.descriptor().concurrency;
        self.stats.expected.fetch_add(concurrency, Ordering::SeqCst);

        (0..concurrency)
            .map(|index| tokio::spawn(Arc::clone(&self).supervise(index)))
            .collect()
    }

    fn working_queue(&self) -> String {
        let descriptor = self.listener.descriptor();
        self.names
            .working_queue(&descriptor.notification_type, &descriptor.listener_name)
    }

    /// Restarts the worker after any framework failure until shutdown.
    async fn supervise(self: Arc<Self>, index: usize) {
        let queue = self.working_queue();
        let mut backoff = RestartBackoff::new(*self.client.reconnect_policy());

        while !self.shutdown.is_cancelled() {
            match self.consume(&queue, index, &mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    let delay = backoff.next_delay();

                    error!(
                        queue = %queue,
                        worker = index,
                        failures = backoff.failures(),
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Worker failed, restarting after back-off"
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        info!(queue = %queue, worker = index, "Worker stopped");
    }

    /// Consumes until shutdown (`Ok`) or a broker failure (`Err`).
    async fn consume(
        &self,
        queue: &str,
        index: usize,
        backoff: &mut RestartBackoff,
    ) -> Result<()> {
        let channel = self.client.consumer_channel(1).await?;
        let consumer_tag = format!("{}-{}", queue, index);

        let mut consumer = channel
            .basic_consume(
                queue.into(),
                consumer_tag.as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                DispatchError::BrokerUnavailable(format!("Failed to create consumer: {}", e))
            })?;

        backoff.reset();
        let _running = RunningGuard::new(&self.stats.running);
        info!(queue = %queue, worker = index, "Consumer started");

        let outcome = loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Err(e) = self.settle(&channel, delivery).await {
                        break Err(e);
                    }
                }
                Some(Err(e)) => {
                    break Err(DispatchError::BrokerUnavailable(format!(
                        "Consumer delivery error: {}",
                        e
                    )));
                }
                None => {
                    break Err(DispatchError::BrokerUnavailable(
                        "Consumer stream ended".to_string(),
                    ));
                }
            }
        };

        if let Err(e) = channel.close(200, "worker stopped".into()).await {
            debug!(queue = %queue, error = %e, "Channel close failed");
        }

        outcome
    }

    async fn settle(&self, channel: &Channel, delivery: Delivery) -> Result<()> {
        let descriptor = self.listener.descriptor();
        let envelope = Envelope::from_headers(
            delivery.properties.headers().as_ref(),
            &self.names.broadcast_key(&descriptor.notification_type),
            now_millis(),
        );

        debug!(
            listener = %descriptor.listener_name,
            delivery_tag = delivery.delivery_tag,
            attempt = envelope.attempt,
            redelivered = delivery.redelivered,
            "Delivery received"
        );

        match evaluate_delivery(&self.listener, &delivery.data, &envelope, &self.debounce).await {
            Disposition::Ack => {
                delivery
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(|e| broker_error("acknowledge", e))?;
                self.stats.acked.fetch_add(1, Ordering::SeqCst);
            }
            Disposition::Retry { envelope, ttl_ms } => {
                let queue = self
                    .names
                    .retry_queue(&descriptor.notification_type, &descriptor.listener_name);

                if self.forward(channel, &delivery, &queue, &envelope, Some(ttl_ms)).await? {
                    self.stats.retried.fetch_add(1, Ordering::SeqCst);
                    info!(
                        queue = %queue,
                        attempt = envelope.attempt,
                        ttl_ms,
                        "Delivery scheduled for retry"
                    );
                }
            }
            Disposition::Dead { envelope } => {
                let queue = self
                    .names
                    .dead_queue(&descriptor.notification_type, &descriptor.listener_name);

                if self.forward(channel, &delivery, &queue, &envelope, None).await? {
                    self.stats.dead.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        queue = %queue,
                        attempt = envelope.attempt,
                        last_error = ?envelope.last_error,
                        "Delivery dead-lettered"
                    );
                }
            }
        }

        Ok(())
    }

    /// Republishes the delivery to `queue` and acks the original. When the
    /// republish fails the original is requeued instead so nothing is lost.
    /// Returns whether the message moved.
    async fn forward(
        &self,
        channel: &Channel,
        delivery: &Delivery,
        queue: &str,
        envelope: &Envelope,
        ttl_ms: Option<u64>,
    ) -> Result<bool> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_headers(envelope.to_headers());

        if let Some(content_type) = delivery.properties.content_type() {
            properties = properties.with_content_type(content_type.clone());
        }

        if let Some(ttl) = ttl_ms {
            properties = properties.with_expiration(ttl.to_string().into());
        }

        let republished = publish_confirmed(
            channel,
            "",
            queue,
            &delivery.data,
            properties,
            self.confirm_timeout,
        )
        .await;

        match settle_forwarded(&republished) {
            Settlement::Ack => {
                delivery
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(|e| broker_error("acknowledge", e))?;
                Ok(true)
            }
            Settlement::Requeue => {
                if let Err(e) = &republished {
                    warn!(
                        queue = %queue,
                        delivery_tag = delivery.delivery_tag,
                        error = %e,
                        "Republish failed, requeueing original delivery"
                    );
                }

                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| broker_error("requeue", e))?;
                self.stats.requeued.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

fn broker_error(action: &str, e: lapin::Error) -> DispatchError {
    DispatchError::BrokerUnavailable(format!("Failed to {} delivery: {}", action, e))
}

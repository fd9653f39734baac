use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use lapin::{BasicProperties, Channel, options::BasicPublishOptions};
use tokio::{
    sync::{Semaphore, SemaphorePermit},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    clients::{
        codec::{Codec, JsonCodec},
        rbmq::RabbitMqClient,
        topology::TopologyManager,
    },
    config::Config,
    error::{DispatchError, Result},
    models::{envelope::Envelope, notification::Notification},
    utils::now_millis,
};

/// Publishes notifications with publisher confirms. Each call returns only
/// after the broker acknowledged the message or the confirm timeout expired.
/// The timeout covers the whole call, including declaring the type's
/// entities and (re)connecting.
pub struct Publisher<C: Codec = JsonCodec> {
    topology: Arc<TopologyManager>,
    codec: C,
    confirm_timeout: Duration,
    pool: ChannelPool,
    declared_types: Mutex<HashSet<&'static str>>,
}

impl<C: Codec> Publisher<C> {
    pub fn new(
        client: Arc<RabbitMqClient>,
        topology: Arc<TopologyManager>,
        codec: C,
        config: &Config,
    ) -> Self {
        Self {
            topology,
            codec,
            confirm_timeout: config.publish_confirm_timeout(),
            pool: ChannelPool::new(client, config.broker_publisher_channels),
            declared_types: Mutex::new(HashSet::new()),
        }
    }

    pub async fn publish<N: Notification>(&self, notification: &N) -> Result<()> {
        self.publish_delayed(notification, 0).await
    }

    /// `delay_ms = 0` falls back to the type's static delay, if any.
    pub async fn publish_delayed<N: Notification>(
        &self,
        notification: &N,
        delay_ms: u64,
    ) -> Result<()> {
        let delay = N::effective_delay(delay_ms);
        let payload = self.codec.encode(notification)?;

        timeout(self.confirm_timeout, self.send::<N>(payload, delay))
            .await
            .map_err(|_| {
                warn!(
                    notification_type = N::TYPE_NAME,
                    timeout_ms = self.confirm_timeout.as_millis() as u64,
                    "Publish timed out"
                );
                DispatchError::Publish(format!(
                    "Not confirmed within {}ms",
                    self.confirm_timeout.as_millis()
                ))
            })?
    }

    async fn send<N: Notification>(&self, payload: Vec<u8>, delay: Option<u64>) -> Result<()> {
        self.ensure_declared::<N>().await?;

        let names = self.topology.names();
        let route = names.publish_route(N::TYPE_NAME, self.topology.strategy(), delay);

        let envelope =
            Envelope::new(names.broadcast_key(N::TYPE_NAME), now_millis()).with_delay(delay);

        let mut properties = BasicProperties::default()
            .with_content_type(self.codec.content_type().into())
            .with_delivery_mode(2)
            .with_headers(envelope.to_headers());

        if let Some(expiration) = route.expiration_ms {
            properties = properties.with_expiration(expiration.to_string().into());
        }

        let mut channel = self.pool.checkout().await?;

        let published = publish_confirmed(
            channel.channel(),
            &route.exchange,
            &route.routing_key,
            &payload,
            properties,
            self.confirm_timeout,
        )
        .await;

        if let Err(e) = published {
            channel.discard();
            warn!(
                notification_type = N::TYPE_NAME,
                exchange = %route.exchange,
                error = %e,
                "Publish failed"
            );
            return Err(e);
        }

        debug!(
            notification_type = N::TYPE_NAME,
            exchange = %route.exchange,
            routing_key = %route.routing_key,
            delay_ms = ?delay,
            "Notification published"
        );

        Ok(())
    }

    /// Declares the type's entities once per publisher. Concurrent first
    /// publishes of one type may both declare; declares are idempotent.
    async fn ensure_declared<N: Notification>(&self) -> Result<()> {
        if self.declared().contains(N::TYPE_NAME) {
            return Ok(());
        }

        self.topology
            .ensure_type(N::TYPE_NAME)
            .await
            .map_err(|e| match e {
                DispatchError::BrokerUnavailable(reason) => DispatchError::Publish(reason),
                other => other,
            })?;
        self.declared().insert(N::TYPE_NAME);

        Ok(())
    }

    fn declared(&self) -> MutexGuard<'_, HashSet<&'static str>> {
        self.declared_types.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Publishes on a confirm channel and waits for the broker's verdict.
pub(crate) async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
    properties: BasicProperties,
    confirm_timeout: Duration,
) -> Result<()> {
    let confirmation = timeout(confirm_timeout, async {
        channel
            .basic_publish(
                exchange.into(),
                routing_key.into(),
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await
    })
    .await
    .map_err(|_| {
        DispatchError::Publish(format!(
            "No confirm within {}ms",
            confirm_timeout.as_millis()
        ))
    })?
    .map_err(|e| DispatchError::Publish(format!("Failed to publish: {}", e)))?;

    if confirmation.is_nack() {
        return Err(DispatchError::Publish(format!(
            "Broker rejected message for exchange '{}'",
            exchange
        )));
    }

    Ok(())
}

/// Bounded set of confirm channels shared by publishing callers. A channel
/// is used by one caller at a time.
struct ChannelPool {
    client: Arc<RabbitMqClient>,
    idle: Mutex<Vec<Channel>>,
    permits: Semaphore,
}

impl ChannelPool {
    fn new(client: Arc<RabbitMqClient>, size: usize) -> Self {
        Self {
            client,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Semaphore::new(size),
        }
    }

    async fn checkout(&self) -> Result<PooledChannel<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DispatchError::Publish("Publisher closed".to_string()))?;

        let reusable = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            let found = std::iter::from_fn(|| idle.pop()).find(|c| c.status().connected());
            found
        };

        let channel = match reusable {
            Some(channel) => channel,
            None => self
                .client
                .confirm_channel()
                .await
                .map_err(|e| DispatchError::Publish(e.to_string()))?,
        };

        Ok(PooledChannel {
            pool: self,
            channel,
            discarded: false,
            _permit: permit,
        })
    }
}

struct PooledChannel<'a> {
    pool: &'a ChannelPool,
    channel: Channel,
    discarded: bool,
    _permit: SemaphorePermit<'a>,
}

impl PooledChannel<'_> {
    fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Keeps a channel that failed a publish out of the pool.
    fn discard(&mut self) {
        self.discarded = true;
    }
}

impl Drop for PooledChannel<'_> {
    fn drop(&mut self) {
        if !self.discarded && self.channel.status().connected() {
            let mut idle = self.pool.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.push(self.channel.clone());
        }
    }
}

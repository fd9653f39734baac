use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use lapin::{
    Channel, Connection, ConnectionProperties,
    options::{BasicQosOptions, ConfirmSelectOptions},
    uri::AMQPUri,
};
use tokio::{sync::RwLock, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{DispatchError, Result},
    models::retry::RetryPolicy,
    utils::reconnect_delay,
};

/// Owns the broker connection and hands out channels. A dropped connection is
/// re-established lazily by the next caller asking for a channel.
pub struct RabbitMqClient {
    uri: String,
    connection: RwLock<Option<Arc<Connection>>>,
    reconnect_policy: RetryPolicy,
    connected: AtomicBool,
}

impl RabbitMqClient {
    /// Connects, retrying with back-off until the broker answers. Only a
    /// malformed URI fails immediately.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Self::new(config)?;

        let mut attempt = 0;
        loop {
            attempt += 1;

            match client.reconnect().await {
                Ok(_) => return Ok(client),
                Err(e) => {
                    let delay = reconnect_delay(&client.reconnect_policy, attempt);
                    warn!(
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker unavailable, retrying connection"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Single connection attempt, no retry.
    pub async fn try_connect(config: &Config) -> Result<Self> {
        let client = Self::new(config)?;
        client.reconnect().await?;

        Ok(client)
    }

    /// Client that connects on first use.
    pub fn new(config: &Config) -> Result<Self> {
        config
            .broker_uri
            .parse::<AMQPUri>()
            .map_err(|e| DispatchError::Config(format!("Invalid broker URI: {}", e)))?;

        Ok(Self {
            uri: config.broker_uri.clone(),
            connection: RwLock::new(None),
            reconnect_policy: config.retry_policy(),
            connected: AtomicBool::new(false),
        })
    }

    async fn reconnect(&self) -> Result<Arc<Connection>> {
        let mut guard = self.connection.write().await;

        if let Some(connection) = guard.as_ref() {
            if connection.status().connected() {
                return Ok(Arc::clone(connection));
            }
        }

        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                DispatchError::BrokerUnavailable(format!("Failed to connect to RabbitMQ: {}", e))
            })?;

        info!("RabbitMQ connection established");

        let connection = Arc::new(connection);
        *guard = Some(Arc::clone(&connection));
        self.connected.store(true, Ordering::SeqCst);

        Ok(connection)
    }

    async fn live_connection(&self) -> Result<Arc<Connection>> {
        {
            let guard = self.connection.read().await;
            if let Some(connection) = guard.as_ref() {
                if connection.status().connected() {
                    return Ok(Arc::clone(connection));
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.reconnect().await
    }

    pub async fn channel(&self) -> Result<Channel> {
        let connection = self.live_connection().await?;

        connection.create_channel().await.map_err(|e| {
            DispatchError::BrokerUnavailable(format!("RabbitMQ channel creation failed: {}", e))
        })
    }

    /// Channel in publisher-confirm mode.
    pub async fn confirm_channel(&self) -> Result<Channel> {
        let channel = self.channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                DispatchError::BrokerUnavailable(format!("Failed to enable confirms: {}", e))
            })?;

        debug!("Confirm channel created");

        Ok(channel)
    }

    /// Confirm channel limited to `prefetch` unacked deliveries.
    pub async fn consumer_channel(&self, prefetch: u16) -> Result<Channel> {
        let channel = self.confirm_channel().await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|_| DispatchError::BrokerUnavailable("Failed to set up QoS".to_string()))?;

        Ok(channel)
    }

    /// Health signal: false while the broker is unreachable.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect_policy(&self) -> &RetryPolicy {
        &self.reconnect_policy
    }

    pub async fn close(&self) {
        let mut guard = self.connection.write().await;

        if let Some(connection) = guard.take() {
            if let Err(e) = connection.close(200, "shutdown".into()).await {
                debug!(error = %e, "Connection close failed");
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("RabbitMQ connection closed");
    }
}

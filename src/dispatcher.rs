use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    clients::{
        codec::Codec,
        consumer::{ListenerConsumer, WorkerStats},
        debounce::DebounceCoordinator,
        health::HealthChecker,
        publisher::Publisher,
        rbmq::RabbitMqClient,
        registry::ListenerRegistry,
        topology::TopologyManager,
    },
    config::Config,
    error::{DispatchError, Result},
    utils::retry_with_backoff,
};

/// Wires the broker client, topology, publisher, consumers and debounce
/// coordinator together. Nothing is shared between them except what is
/// passed in here.
pub struct Dispatcher;

impl Dispatcher {
    /// Connects, provisions topology for every registered listener and starts
    /// their workers. Provisioning that fails on a broker blip is retried with
    /// the reconnect back-off; a topology conflict aborts startup at once.
    pub async fn start<C: Codec>(
        config: &Config,
        registry: ListenerRegistry<C>,
    ) -> Result<DispatcherHandle<C>> {
        config.validate()?;

        let client = Arc::new(RabbitMqClient::connect(config).await?);
        let topology = Arc::new(TopologyManager::new(Arc::clone(&client), config));

        let descriptors = registry.descriptors();
        let provisioned = retry_with_backoff(
            client.reconnect_policy(),
            |e: &DispatchError| !e.is_fatal(),
            || topology.ensure_topology(&descriptors),
        )
        .await;

        if let Err(e) = provisioned {
            error!(error = %e, "Topology provisioning failed, refusing to start");
            client.close().await;
            return Err(e);
        }

        let publisher = Arc::new(Publisher::new(
            Arc::clone(&client),
            Arc::clone(&topology),
            registry.codec().clone(),
            config,
        ));

        let debounce = DebounceCoordinator::new();
        let shutdown = CancellationToken::new();
        let stats = Arc::new(WorkerStats::default());

        let mut workers = Vec::new();
        for listener in registry.into_listeners() {
            let consumer = Arc::new(ListenerConsumer::new(
                listener,
                Arc::clone(&client),
                topology.names().clone(),
                debounce.clone(),
                config.publish_confirm_timeout(),
                shutdown.clone(),
                Arc::clone(&stats),
            ));
            workers.extend(consumer.spawn());
        }

        info!(workers = workers.len(), "Dispatcher started");

        Ok(DispatcherHandle {
            client,
            publisher,
            debounce,
            shutdown,
            stats,
            workers,
            grace: config.shutdown_grace(),
        })
    }
}

pub struct DispatcherHandle<C: Codec> {
    client: Arc<RabbitMqClient>,
    publisher: Arc<Publisher<C>>,
    debounce: DebounceCoordinator,
    shutdown: CancellationToken,
    stats: Arc<WorkerStats>,
    workers: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl<C: Codec> DispatcherHandle<C> {
    pub fn publisher(&self) -> Arc<Publisher<C>> {
        Arc::clone(&self.publisher)
    }

    pub fn debounce(&self) -> &DebounceCoordinator {
        &self.debounce
    }

    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(
            Arc::clone(&self.client),
            Arc::clone(&self.stats),
            self.debounce.clone(),
        )
    }

    /// Cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops taking deliveries, lets in-flight handlers finish within the
    /// grace period, fires pending debounce entries, then closes the
    /// connection. Unacked deliveries are redelivered on the next start.
    pub async fn shutdown(self) -> Result<()> {
        info!(grace_ms = self.grace.as_millis() as u64, "Dispatcher shutting down");
        self.shutdown.cancel();

        let aborts: Vec<_> = self.workers.iter().map(|w| w.abort_handle()).collect();
        if timeout(self.grace, join_all(self.workers)).await.is_err() {
            warn!(
                workers = aborts.len(),
                "In-flight handlers exceeded grace period, forcing workers closed"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        let drained = self.debounce.drain(self.grace).await;

        self.client.close().await;

        if let Err(e) = &drained {
            error!(error = %e, "Debounce drain incomplete");
        }

        drained
    }
}

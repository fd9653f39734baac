use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use notification_dispatch::{
    Config, Dispatcher, ListenerContext, ListenerRegistry, ListenerSpec, Notification,
    api::run_api_server, utils::init_tracing,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

/// Published once at startup so a fresh deployment shows one round trip in the logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Heartbeat {
    id: Uuid,
    sent_at: DateTime<Utc>,
}

impl Notification for Heartbeat {
    const TYPE_NAME: &'static str = "Heartbeat";
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = Config::load()?;

    let mut registry = ListenerRegistry::new(&config);
    registry.register(ListenerSpec::new(
        "log",
        |heartbeat: Heartbeat, context: ListenerContext| async move {
            info!(
                id = %heartbeat.id,
                listener = %context.listener_name,
                latency_ms = (Utc::now() - heartbeat.sent_at).num_milliseconds(),
                "Heartbeat received"
            );
            Ok::<_, Error>(())
        },
    ))?;

    let handle = Dispatcher::start(&config, registry).await?;

    let api = tokio::spawn(run_api_server(
        config.server_port,
        handle.health_checker(),
        handle.shutdown_token(),
    ));

    handle
        .publisher()
        .publish(&Heartbeat {
            id: Uuid::new_v4(),
            sent_at: Utc::now(),
        })
        .await?;

    info!("Worker is ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    handle.shutdown().await?;

    match api.await {
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task panicked"),
        Ok(Ok(())) => {}
    }

    Ok(())
}

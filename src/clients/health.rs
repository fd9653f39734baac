use std::{
    collections::HashMap,
    sync::{Arc, atomic::Ordering},
};

use chrono::Utc;
use tracing::debug;

use crate::{
    clients::{consumer::WorkerStats, debounce::DebounceCoordinator, rbmq::RabbitMqClient},
    models::health::{HealthCheckResponse, HealthStatus, ServiceHealth},
};

#[derive(Clone)]
pub struct HealthChecker {
    client: Arc<RabbitMqClient>,
    stats: Arc<WorkerStats>,
    debounce: DebounceCoordinator,
}

impl HealthChecker {
    pub fn new(
        client: Arc<RabbitMqClient>,
        stats: Arc<WorkerStats>,
        debounce: DebounceCoordinator,
    ) -> Self {
        Self {
            client,
            stats,
            debounce,
        }
    }

    pub fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("message_broker".to_string(), self.check_broker());
        checks.insert("consumers".to_string(), self.check_consumers());
        checks.insert("debounce".to_string(), self.check_debounce());

        let status = determine_overall_status(&checks);

        HealthCheckResponse {
            status,
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            checks,
        }
    }

    fn check_broker(&self) -> ServiceHealth {
        if self.client.is_connected() {
            ServiceHealth::healthy(0)
        } else {
            ServiceHealth::unhealthy("Broker connection unavailable".to_string())
        }
    }

    fn check_consumers(&self) -> ServiceHealth {
        let expected = self.stats.expected.load(Ordering::SeqCst);
        let running = self.stats.running.load(Ordering::SeqCst);

        let detail = format!(
            "running={} expected={} acked={} retried={} dead={} requeued={}",
            running,
            expected,
            self.stats.acked.load(Ordering::SeqCst),
            self.stats.retried.load(Ordering::SeqCst),
            self.stats.dead.load(Ordering::SeqCst),
            self.stats.requeued.load(Ordering::SeqCst),
        );

        debug!(running, expected, "Consumer health checked");

        if running >= expected {
            ServiceHealth::healthy(0).with_detail(detail)
        } else {
            ServiceHealth::degraded(format!("{} of {} workers running", running, expected))
                .with_detail(detail)
        }
    }

    fn check_debounce(&self) -> ServiceHealth {
        ServiceHealth::healthy(0).with_detail(format!("pending={}", self.debounce.pending()))
    }
}

fn determine_overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let broker_unhealthy = checks
        .get("message_broker")
        .is_some_and(|health| health.status == HealthStatus::Unhealthy);

    let has_unhealthy = checks
        .values()
        .any(|health| health.status == HealthStatus::Unhealthy);

    let has_degraded = checks
        .values()
        .any(|health| health.status == HealthStatus::Degraded);

    if broker_unhealthy || has_unhealthy {
        HealthStatus::Unhealthy
    } else if has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

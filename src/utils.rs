use chrono::Utc;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::models::retry::RetryPolicy;

/// Installs the global subscriber. `RUST_LOG` filters, `LOG_FORMAT=json`
/// switches to structured output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };

    if result.is_err() {
        debug!("Tracing subscriber already installed");
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Runs `operation` until it succeeds, fails with an error `retryable`
/// rejects, or `policy.max_attempts` is reached, sleeping the policy's
/// back-off (with ±10% jitter) in between.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    retryable: R,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        "Retry succeeded"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !retryable(&e) {
                    debug!(attempt, error = %e, "Not retrying permanent failure");
                    return Err(e);
                }

                if attempt >= policy.max_attempts {
                    warn!(
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                let delay_ms = jittered(policy.delay_for(attempt));

                debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms,
                    "Retry attempt failed, backing off"
                );

                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

/// Back-off that never gives up, for reconnecting to the broker. Returns the
/// delay to sleep before attempt `attempt + 1`.
pub fn reconnect_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    Duration::from_millis(jittered(policy.delay_for(attempt.max(1))))
}

fn jittered(delay_ms: u64) -> u64 {
    let jitter = rand::random_range(-0.1..=0.1);
    (delay_ms as f64 * (1.0 + jitter)) as u64
}

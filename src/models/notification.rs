use serde::{Serialize, de::DeserializeOwned};

use crate::models::retry::RetryPolicy;

/// A payload that can be published to, and consumed by, named listeners.
///
/// `TYPE_NAME` becomes part of every exchange and queue name for the type, so
/// it must stay stable across deployments and must not contain `#`.
pub trait Notification: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    /// Delay applied to every publish of this type unless the caller overrides it.
    const DELAY_MS: Option<u64> = None;

    /// Retry policy for listeners of this type that do not set their own.
    const RETRY_POLICY: Option<RetryPolicy> = None;

    /// Runtime delay wins when positive, otherwise the type's static delay.
    fn effective_delay(delay_ms: u64) -> Option<u64> {
        if delay_ms > 0 {
            Some(delay_ms)
        } else {
            Self::DELAY_MS.filter(|d| *d > 0)
        }
    }
}

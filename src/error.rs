use lapin::{
    ErrorKind,
    protocol::{AMQPErrorKind, AMQPSoftError},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failure classes surfaced by the dispatch core.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A declaration clashes with an existing broker entity. Fatal at startup.
    #[error("Topology conflict on '{entity}': {reason}")]
    TopologyConflict { entity: String, reason: String },

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Debounce drain timed out with {pending} pending entries")]
    DebounceDrainTimeout { pending: usize },

    #[error("Invalid listener registration: {0}")]
    Registration(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl DispatchError {
    /// Classifies a failed declare call. The broker answers a mismatched
    /// redeclaration with PRECONDITION_FAILED and closes the channel.
    pub fn from_declare(entity: &str, err: lapin::Error) -> Self {
        match err.kind() {
            ErrorKind::ProtocolError(e)
                if *e.kind() == AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) =>
            {
                DispatchError::TopologyConflict {
                    entity: entity.to_string(),
                    reason: e.get_message().to_string(),
                }
            }
            _ => DispatchError::BrokerUnavailable(format!("Failed to declare {}: {}", entity, err)),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::TopologyConflict { .. }
                | DispatchError::Registration(_)
                | DispatchError::Config(_)
        )
    }
}

/// Delivery-level errors for MTS.
///
/// `NotFound` is the only transient variant: the routing decision retries
/// it while resolving an agent's location. Every other variant is terminal
/// for the message it concerns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("agent not found: {agent}")]
    NotFound { agent: String },

    #[error("unreachable: {target}: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("no route to {agent}: {reason}")]
    NoRoute { agent: String, reason: String },

    #[error("no valid address contained within the identifier of {agent}")]
    NoAddress { agent: String },

    #[error("outbound queue full: {size} bytes queued (max {max})")]
    QueueFull { size: usize, max: usize },

    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("delivery deadline expired")]
    Expired,

    #[error("delivery interrupted after {elapsed_ms} ms")]
    Interrupted { elapsed_ms: u64 },

    #[error("delivery aborted: {reason}")]
    Aborted { reason: String },

    #[error("message delivery engine is shut down")]
    ShutDown,

    #[error("payload encoding failed: {0}")]
    Encoding(String),
}

impl DeliveryError {
    pub fn not_found(agent: impl ToString) -> Self {
        DeliveryError::NotFound {
            agent: agent.to_string(),
        }
    }

    pub fn unreachable(target: impl ToString, reason: impl ToString) -> Self {
        DeliveryError::Unreachable {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Transient: the agent may be found on a later resolution attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::NotFound { .. })
    }

    /// A cached location that produced this error must be dropped.
    pub fn evicts_cache(&self) -> bool {
        matches!(
            self,
            DeliveryError::NotFound { .. } | DeliveryError::Unreachable { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for DeliveryError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        DeliveryError::Encoding(e.to_string())
    }
}

/// Errors raised by a message transport protocol implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MtpError {
    #[error("address {address} not supported by {mtp}")]
    UnsupportedAddress { mtp: String, address: String },

    #[error("transport class not registered: {0}")]
    UnknownClass(String),

    #[error("send to {address} failed: {reason}")]
    Send { address: String, reason: String },

    #[error("transport activation failed: {0}")]
    Activation(String),
}

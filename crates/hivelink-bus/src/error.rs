//! Bus error types.

use thiserror::Error;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Message bus error types.
#[derive(Debug, Error)]
pub enum BusError {
    /// No broker connection is currently established.
    #[error("not connected to broker")]
    NotConnected,

    /// The connection dropped while the operation was in flight.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The operation did not complete within its deadline.
    #[error("bus timeout: {0}")]
    Timeout(String),

    /// The broker rejected the operation.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// Payload encode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Whether this failure is transport-level and worth retrying.
    ///
    /// Only these variants are retried by the dispatch backoff policy;
    /// everything else fails the attempt immediately.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BusError::NotConnected | BusError::ConnectionReset(_) | BusError::Timeout(_)
        )
    }
}

impl From<BusError> for hivelink_core::Error {
    fn from(e: BusError) -> Self {
        hivelink_core::Error::Bus(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(BusError::NotConnected.is_transport());
        assert!(BusError::ConnectionReset("peer".into()).is_transport());
        assert!(BusError::Timeout("publish".into()).is_transport());
        assert!(!BusError::Rejected("bad topic".into()).is_transport());
    }
}

//! Error types shared across the bridge.

use thiserror::Error;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error taxonomy.
///
/// Only `NotFound` and `Validation` are ever surfaced to HTTP-facing
/// callers; the messaging path logs and drops instead of returning errors,
/// because there is no reply channel back to a publishing device.
#[derive(Debug, Error)]
pub enum Error {
    /// A referenced entity does not exist (or is soft-deleted).
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. "device" or "firmware release".
        kind: &'static str,
        /// The id that failed to resolve.
        id: i64,
    },

    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Ledger/store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Message bus failure.
    #[error("bus error: {0}")]
    Bus(String),

    /// Payload encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Not-found error for a device id.
    pub fn device_not_found(id: i64) -> Self {
        Error::NotFound { kind: "device", id }
    }

    /// Not-found error for a firmware release id.
    pub fn release_not_found(id: i64) -> Self {
        Error::NotFound {
            kind: "firmware release",
            id,
        }
    }

    /// Not-found error for a command id.
    pub fn command_not_found(id: i64) -> Self {
        Error::NotFound {
            kind: "command",
            id,
        }
    }

    /// Not-found error for an OTA job id.
    pub fn ota_job_not_found(id: i64) -> Self {
        Error::NotFound {
            kind: "ota job",
            id,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

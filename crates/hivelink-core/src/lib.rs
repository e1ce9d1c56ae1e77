//! Core types for HiveLink.
//!
//! This crate defines the foundational pieces shared across the bridge:
//! identifier aliases, environment-driven configuration, the bounded
//! retry/backoff primitive, and the common error taxonomy.

pub mod config;
pub mod error;
pub mod ids;
pub mod retry;

pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use ids::{CommandId, DeviceId, OtaJobId, ReleaseId};
pub use retry::RetryPolicy;

//! The HiveLink bridge.
//!
//! Connects a request/response backend to an unreliable MQTT device fleet:
//! - Command dispatch with bounded publish retry
//! - Acknowledgment reconciliation
//! - OTA job orchestration
//! - Heartbeat/telemetry admission with device-key authentication
//! - Timeout sweepers enforcing the liveness guarantees no device can violate
//!
//! The transport offers at-least-once delivery and devices may never
//! respond; every cross-cutting state transition is a conditional ledger
//! update, so a "last valid writer wins" and every other writer becomes a
//! logged no-op.

pub mod ack;
pub mod dispatch;
pub mod ingest;
pub mod messages;
pub mod ota;
pub mod provision;
pub mod service;
pub mod sweep;

pub use ack::AckHandler;
pub use dispatch::{CommandDispatcher, DispatchOutcome};
pub use ingest::IngestHandler;
pub use ota::{OtaOrchestrator, OtaProgressHandler, OtaTicket};
pub use provision::ProvisionHandler;
pub use service::{BridgeRuntime, BridgeService};
pub use sweep::SweeperHandle;

//! MQTT transport for HiveLink.
//!
//! Provides:
//! - Topic addressing and parsing for per-device channels
//! - A persistent broker connection with automatic reconnect
//! - The publisher trait seam used by the dispatch path

pub mod client;
pub mod error;
pub mod publisher;
pub mod topics;

pub use client::{BusClient, BusClientConfig, InboundMessage};
pub use error::{BusError, Result};
pub use publisher::{MessagePublisher, Qos};
pub use topics::{ParsedTopic, TopicKind, REGISTER_REQUEST_TOPIC};

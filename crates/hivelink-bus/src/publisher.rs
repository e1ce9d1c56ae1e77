//! Publisher trait seam.
//!
//! Dispatch code publishes through this trait so the retry and state
//! transition logic can be exercised without a live broker.

use async_trait::async_trait;

use crate::error::Result;

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Qos {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Delivery assured, duplicates possible.
    #[default]
    AtLeastOnce = 1,
    /// Exactly-once handshake.
    ExactlyOnce = 2,
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Something that can publish a payload to a topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish `payload` to `topic` at the given QoS, without retain.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()>;
}

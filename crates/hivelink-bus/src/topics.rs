//! Topic addressing.
//!
//! Per-device channels follow `devices/{deviceId}/{kind}`; the broker-wide
//! registration channel is `devices/register/request`. Wildcard patterns
//! (`devices/+/{kind}`) fan all devices into one subscription, so the device
//! id is recovered from the topic's second segment. A segment that is not a
//! positive integer means the message is dropped; that parse doubles as the
//! first line of defence against untrusted publishers.

use hivelink_core::DeviceId;

/// Broker-wide channel for self-announcements from unregistered devices.
pub const REGISTER_REQUEST_TOPIC: &str = "devices/register/request";

const PREFIX: &str = "devices";

/// Per-device channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Downlink commands to the device.
    Commands,
    /// Command acknowledgments from the device.
    CommandAck,
    /// Liveness heartbeats.
    Heartbeat,
    /// Sensor telemetry.
    Telemetry,
    /// OTA progress reports.
    OtaProgress,
}

impl TopicKind {
    /// The topic suffix for this kind.
    pub fn suffix(&self) -> &'static str {
        match self {
            TopicKind::Commands => "commands",
            TopicKind::CommandAck => "commands/ack",
            TopicKind::Heartbeat => "heartbeat",
            TopicKind::Telemetry => "telemetry",
            TopicKind::OtaProgress => "ota/progress",
        }
    }

    /// Wildcard subscription pattern fanning in all devices.
    pub fn wildcard(&self) -> String {
        format!("{}/+/{}", PREFIX, self.suffix())
    }

    /// Concrete topic for one device.
    pub fn topic(&self, device_id: DeviceId) -> String {
        format!("{}/{}/{}", PREFIX, device_id, self.suffix())
    }
}

/// A successfully parsed inbound topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedTopic {
    /// A per-device channel.
    Device(DeviceId, TopicKind),
    /// The broker-wide registration channel.
    RegisterRequest,
}

/// Parse an inbound topic.
///
/// Returns `None` for topics outside the addressing scheme and for device
/// segments that are not positive integers (leading `+`/`-`, zero, empty,
/// non-digits all rejected).
pub fn parse(topic: &str) -> Option<ParsedTopic> {
    if topic == REGISTER_REQUEST_TOPIC {
        return Some(ParsedTopic::RegisterRequest);
    }

    let rest = topic.strip_prefix("devices/")?;
    let (id_segment, suffix) = rest.split_once('/')?;

    let device_id = parse_device_id(id_segment)?;

    let kind = match suffix {
        "commands" => TopicKind::Commands,
        "commands/ack" => TopicKind::CommandAck,
        "heartbeat" => TopicKind::Heartbeat,
        "telemetry" => TopicKind::Telemetry,
        "ota/progress" => TopicKind::OtaProgress,
        _ => return None,
    };

    Some(ParsedTopic::Device(device_id, kind))
}

/// Parse a device id segment: digits only, positive, no sign characters.
fn parse_device_id(segment: &str) -> Option<DeviceId> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id: DeviceId = segment.parse().ok()?;
    (id > 0).then_some(id)
}

//! Wire message shapes.
//!
//! One JSON shape per topic kind. Field names follow the device firmware's
//! camelCase convention. All inbound shapes are schema-validated by serde;
//! a parse failure anywhere is a silent drop with a log line, because
//! devices are untrusted input sources and must never crash the bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hivelink_core::{CommandId, OtaJobId};

/// Outbound command envelope published to `devices/{id}/commands`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Ledger id the device must echo back in its ack.
    pub command_id: CommandId,
    /// Directive name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque directive parameters.
    pub payload: Value,
}

/// Ack status reported by a device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Acked,
    Failed,
}

/// Inbound ack on `devices/{id}/commands/ack`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    pub command_id: CommandId,
    pub status: AckStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Inbound heartbeat on `devices/{id}/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub device_key: String,
    #[serde(default)]
    pub mqtt_client_id: Option<String>,
}

/// Sensor block inside a telemetry message. Unknown fields are preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryData {
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default)]
    pub gas_ppm: Option<f64>,
    #[serde(default)]
    pub flame: Option<bool>,
    #[serde(default)]
    pub bin_level: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Inbound telemetry on `devices/{id}/telemetry`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    pub device_key: String,
    /// Device-supplied sample time (unix millis). Ingest time when absent.
    #[serde(default)]
    pub ts: Option<i64>,
    pub data: TelemetryData,
}

/// Inbound OTA progress on `devices/{id}/ota/progress`.
///
/// `status` stays a raw string here so an unknown value can be dropped with
/// a distinct log line instead of a generic parse failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OtaProgressMessage {
    pub ota_job_id: OtaJobId,
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Self-announcement from an unregistered device on
/// `devices/register/request`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub mac: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub firmware: String,
    pub ip: String,
}

/// Credentials grant published on the registration topic, keyed by MAC so an
/// unregistered device can recognize its own grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsGrant {
    #[serde(rename = "type")]
    pub kind: String,
    pub mac: String,
    pub device_id: i64,
    pub device_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_envelope_wire_shape() {
        let envelope = CommandEnvelope {
            command_id: 42,
            kind: "SET_POWER".into(),
            payload: serde_json::json!({"on": true}),
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["commandId"], 42);
        assert_eq!(wire["type"], "SET_POWER");
        assert_eq!(wire["payload"]["on"], true);
    }

    #[test]
    fn test_ack_parsing() {
        let ack: AckMessage =
            serde_json::from_str(r#"{"commandId": 42, "status": "ACKED"}"#).unwrap();
        assert_eq!(ack.command_id, 42);
        assert_eq!(ack.status, AckStatus::Acked);
        assert!(ack.error.is_none());

        // Unknown status values fail schema validation.
        assert!(
            serde_json::from_str::<AckMessage>(r#"{"commandId": 1, "status": "MAYBE"}"#).is_err()
        );
        // Missing commandId fails too.
        assert!(serde_json::from_str::<AckMessage>(r#"{"status": "ACKED"}"#).is_err());
    }

    #[test]
    fn test_telemetry_preserves_unknown_fields() {
        let msg: TelemetryMessage = serde_json::from_str(
            r#"{"deviceKey": "k", "data": {"gasPpm": 512.0, "rssi": -60}}"#,
        )
        .unwrap();
        assert_eq!(msg.data.gas_ppm, Some(512.0));
        assert_eq!(msg.data.extra["rssi"], -60);
    }

    #[test]
    fn test_register_request_requires_all_fields() {
        let ok: RegisterRequest = serde_json::from_str(
            r#"{"mac": "aa:bb:cc:dd:ee:ff", "type": "smart_bin", "firmware": "1.0.0", "ip": "10.0.0.7"}"#,
        )
        .unwrap();
        assert_eq!(ok.device_type, "smart_bin");

        assert!(serde_json::from_str::<RegisterRequest>(r#"{"mac": "aa"}"#).is_err());
    }
}

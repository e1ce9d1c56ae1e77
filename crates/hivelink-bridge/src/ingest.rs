//! Telemetry and heartbeat admission.
//!
//! Both channels carry the device's shared key, because topic names alone
//! prove nothing. Heartbeats authenticate with a single conditional
//! directory update; telemetry needs the record loaded first (the reading
//! must be persisted against it), so the key comparison happens against the
//! loaded row. A mismatch anywhere drops the whole message. There is no
//! reply channel, so nothing is ever raised back to the device.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, info, warn};

use hivelink_core::config::AlarmThresholds;
use hivelink_core::DeviceId;
use hivelink_storage::{
    alarms::DEDUP_WINDOW_SECS, AlarmKind, AlarmStore, DeviceStore, NewAlarm, NewReading,
    ReadingStore,
};

use crate::messages::{HeartbeatMessage, TelemetryData, TelemetryMessage};

/// Source tag recorded on alarms raised from telemetry.
const ALARM_SOURCE: &str = "telemetry";

/// Admits heartbeats and telemetry into the directory and the ledger.
#[derive(Clone)]
pub struct IngestHandler {
    devices: DeviceStore,
    readings: ReadingStore,
    alarms: AlarmStore,
    thresholds: AlarmThresholds,
}

impl IngestHandler {
    /// Create an ingest handler.
    pub fn new(
        devices: DeviceStore,
        readings: ReadingStore,
        alarms: AlarmStore,
        thresholds: AlarmThresholds,
    ) -> Self {
        Self {
            devices,
            readings,
            alarms,
            thresholds,
        }
    }

    /// Handle one raw heartbeat payload from `device_id`'s heartbeat topic.
    pub fn handle_heartbeat(&self, device_id: DeviceId, payload: &[u8]) {
        let msg: HeartbeatMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(device_id, "dropping malformed heartbeat: {e}");
                return;
            }
        };

        match self
            .devices
            .heartbeat_touch(device_id, &msg.device_key, msg.mqtt_client_id)
        {
            Ok(true) => debug!(device_id, "heartbeat admitted"),
            Ok(false) => {
                warn!(device_id, "heartbeat rejected: unknown device or key mismatch");
            }
            Err(e) => warn!(device_id, "heartbeat update failed: {e}"),
        }
    }

    /// Handle one raw telemetry payload from `device_id`'s telemetry topic.
    pub fn handle_telemetry(&self, device_id: DeviceId, payload: &[u8]) {
        let msg: TelemetryMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(device_id, "dropping malformed telemetry: {e}");
                return;
            }
        };

        let device = match self.devices.get_active(device_id) {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(device_id, "dropping telemetry from unknown device");
                return;
            }
            Err(e) => {
                warn!(device_id, "telemetry device lookup failed: {e}");
                return;
            }
        };

        if device.device_key != msg.device_key {
            warn!(device_id, "dropping telemetry: device key mismatch");
            return;
        }

        if let Err(e) = self.devices.mark_seen(device_id) {
            warn!(device_id, "telemetry liveness update failed: {e}");
        }

        let ts = msg
            .ts
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(Utc::now);

        let data = msg.data;
        if let Err(e) = self.readings.insert(NewReading {
            device_id,
            ts,
            current: data.current,
            gas_ppm: data.gas_ppm,
            flame: data.flame,
            bin_level: data.bin_level,
            extra: serde_json::Value::Object(data.extra.clone()),
        }) {
            warn!(device_id, "failed to persist reading: {e}");
            return;
        }

        self.evaluate_alarms(device_id, ts, &data);
    }

    /// Evaluate fixed thresholds and raise each candidate through the dedup
    /// window.
    fn evaluate_alarms(&self, device_id: DeviceId, ts: DateTime<Utc>, data: &TelemetryData) {
        let mut candidates: Vec<(AlarmKind, String)> = Vec::new();

        if let Some(gas) = data.gas_ppm {
            if gas > self.thresholds.gas_ppm {
                candidates.push((
                    AlarmKind::GasLeak,
                    format!("gas {gas:.0}ppm over threshold {:.0}ppm", self.thresholds.gas_ppm),
                ));
            }
        }
        if data.flame == Some(true) {
            candidates.push((AlarmKind::Flame, "flame detected".to_string()));
        }
        if let Some(level) = data.bin_level {
            if level > self.thresholds.bin_level {
                candidates.push((
                    AlarmKind::BinFull,
                    format!("bin at {level:.0}% over threshold {:.0}%", self.thresholds.bin_level),
                ));
            }
        }
        if let (Some(current), Some(limit)) = (data.current, self.thresholds.current_a) {
            if current > limit {
                candidates.push((
                    AlarmKind::Overcurrent,
                    format!("current {current:.2}A over threshold {limit:.2}A"),
                ));
            }
        }

        let window = Duration::seconds(DEDUP_WINDOW_SECS);
        for (kind, message) in candidates {
            match self.alarms.raise(
                NewAlarm {
                    device_id,
                    kind,
                    source: ALARM_SOURCE.to_string(),
                    message,
                },
                window,
            ) {
                Ok(Some(alarm)) => {
                    info!(device_id, kind = kind.as_str(), alarm_id = alarm.id, ts = %ts, "alarm raised");
                }
                Ok(None) => {
                    info!(device_id, kind = kind.as_str(), "alarm suppressed by dedup window");
                }
                Err(e) => {
                    warn!(device_id, kind = kind.as_str(), "alarm insert failed: {e}");
                }
            }
        }
    }
}

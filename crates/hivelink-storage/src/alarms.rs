//! Alarm store with dedup window.
//!
//! Alarms derive from anomalous telemetry. The ingestion contract is the
//! dedup window: for a given `(device, kind, source)` tuple, no second alarm
//! row may be created within 60 seconds of an existing one. The window check
//! and the insert share one write transaction, so two racing candidates
//! cannot both pass the check.

use chrono::{DateTime, Duration, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use hivelink_core::DeviceId;

use crate::codec::{self, META_TABLE};
use crate::error::Result;
use crate::Ledger;

// Alarms table: key = (device id, alarm id), value = Alarm (JSON)
pub(crate) const ALARMS_TABLE: TableDefinition<(i64, i64), &str> = TableDefinition::new("alarms");

const ID_KEY: &str = "alarms";

/// Default dedup window.
pub const DEDUP_WINDOW_SECS: i64 = 60;

/// What tripped the alarm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmKind {
    /// Gas concentration over threshold.
    GasLeak,
    /// Flame detected.
    Flame,
    /// Bin fill level over threshold.
    BinFull,
    /// Current draw over threshold.
    Overcurrent,
}

impl AlarmKind {
    /// Kind as the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmKind::GasLeak => "GAS_LEAK",
            AlarmKind::Flame => "FLAME",
            AlarmKind::BinFull => "BIN_FULL",
            AlarmKind::Overcurrent => "OVERCURRENT",
        }
    }
}

/// An alarm row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    /// Store-allocated id.
    pub id: i64,
    /// Device the anomaly came from.
    pub device_id: DeviceId,
    /// Anomaly kind.
    pub kind: AlarmKind,
    /// Producing subsystem, e.g. "telemetry".
    pub source: String,
    /// Human-readable description.
    pub message: String,
    /// When the anomaly was observed.
    pub triggered_at: DateTime<Utc>,
}

/// Input for raising an alarm.
#[derive(Debug, Clone)]
pub struct NewAlarm {
    pub device_id: DeviceId,
    pub kind: AlarmKind,
    pub source: String,
    pub message: String,
}

/// Alarm store.
#[derive(Clone)]
pub struct AlarmStore {
    ledger: Ledger,
}

impl AlarmStore {
    pub(crate) fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Raise an alarm through the dedup window.
    ///
    /// Returns `Some(alarm)` when a row was created, `None` when an alarm of
    /// the same `(device, kind, source)` already exists with a trigger time
    /// inside `window`.
    pub fn raise(&self, new: NewAlarm, window: Duration) -> Result<Option<Alarm>> {
        let now = Utc::now();
        let cutoff = now - window;

        let txn = self.ledger.db().begin_write()?;
        let created = {
            let mut table = txn.open_table(ALARMS_TABLE)?;

            // Walk this device's alarms newest-first; the scan can stop at
            // the first row older than the window.
            let mut duplicate = false;
            {
                let range = table.range((new.device_id, i64::MIN)..=(new.device_id, i64::MAX))?;
                for entry in range.rev() {
                    let (_, value) = entry?;
                    let alarm: Alarm = codec::decode(value.value())?;
                    if alarm.triggered_at < cutoff {
                        break;
                    }
                    if alarm.kind == new.kind && alarm.source == new.source {
                        duplicate = true;
                        break;
                    }
                }
            }

            if duplicate {
                None
            } else {
                let mut meta = txn.open_table(META_TABLE)?;
                let id = codec::next_id(&mut meta, ID_KEY)?;
                drop(meta);

                let alarm = Alarm {
                    id,
                    device_id: new.device_id,
                    kind: new.kind,
                    source: new.source,
                    message: new.message,
                    triggered_at: now,
                };
                table.insert((alarm.device_id, id), codec::encode(&alarm)?.as_str())?;
                Some(alarm)
            }
        };
        txn.commit()?;
        Ok(created)
    }

    /// Most recent alarms for one device, newest first.
    pub fn recent_for_device(&self, device_id: DeviceId, limit: usize) -> Result<Vec<Alarm>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(ALARMS_TABLE)?;
        let mut out = Vec::new();
        let range = table.range((device_id, i64::MIN)..=(device_id, i64::MAX))?;
        for entry in range.rev() {
            if out.len() >= limit {
                break;
            }
            let (_, value) = entry?;
            out.push(codec::decode(value.value())?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gas_alarm(device_id: DeviceId) -> NewAlarm {
        NewAlarm {
            device_id,
            kind: AlarmKind::GasLeak,
            source: "telemetry".into(),
            message: "gas 612ppm over threshold 500ppm".into(),
        }
    }

    #[test]
    fn test_second_alarm_in_window_suppressed() {
        let store = Ledger::ephemeral().unwrap().alarms();

        let first = store.raise(gas_alarm(7), Duration::seconds(60)).unwrap();
        assert!(first.is_some());

        let second = store.raise(gas_alarm(7), Duration::seconds(60)).unwrap();
        assert!(second.is_none());

        assert_eq!(store.recent_for_device(7, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_alarm_after_window_creates_new_row() {
        let store = Ledger::ephemeral().unwrap().alarms();

        store.raise(gas_alarm(7), Duration::seconds(60)).unwrap();
        // Zero window: the previous alarm is already outside it.
        let third = store.raise(gas_alarm(7), Duration::zero()).unwrap();
        assert!(third.is_some());
        assert_eq!(store.recent_for_device(7, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_window_is_per_kind_and_device() {
        let store = Ledger::ephemeral().unwrap().alarms();
        let window = Duration::seconds(60);

        store.raise(gas_alarm(7), window).unwrap();

        // Different kind, same device: not a duplicate.
        let flame = store
            .raise(
                NewAlarm {
                    device_id: 7,
                    kind: AlarmKind::Flame,
                    source: "telemetry".into(),
                    message: "flame detected".into(),
                },
                window,
            )
            .unwrap();
        assert!(flame.is_some());

        // Same kind, different device: not a duplicate.
        let other_device = store.raise(gas_alarm(8), window).unwrap();
        assert!(other_device.is_some());
    }
}

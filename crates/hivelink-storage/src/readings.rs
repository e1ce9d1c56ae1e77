//! Sensor reading store.
//!
//! Telemetry payloads admitted by the bridge are persisted here, one row per
//! message, keyed by `(device_id, reading_id)` so per-device queries are a
//! range scan.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use hivelink_core::DeviceId;

use crate::codec::{self, META_TABLE};
use crate::error::Result;
use crate::Ledger;

// Readings table: key = (device id, reading id), value = SensorReading (JSON)
pub(crate) const READINGS_TABLE: TableDefinition<(i64, i64), &str> =
    TableDefinition::new("sensor_readings");

const ID_KEY: &str = "sensor_readings";

/// One admitted telemetry sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    /// Store-allocated id.
    pub id: i64,
    /// Reporting device.
    pub device_id: DeviceId,
    /// Sample time: device-supplied when present, ingest time otherwise.
    pub ts: DateTime<Utc>,
    /// Current draw in amperes.
    pub current: Option<f64>,
    /// Gas concentration in ppm.
    pub gas_ppm: Option<f64>,
    /// Flame detector state.
    pub flame: Option<bool>,
    /// Bin fill level in percent.
    pub bin_level: Option<f64>,
    /// Unmodeled payload fields, preserved as-is.
    pub extra: serde_json::Value,
}

/// Input for persisting a reading.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub device_id: DeviceId,
    pub ts: DateTime<Utc>,
    pub current: Option<f64>,
    pub gas_ppm: Option<f64>,
    pub flame: Option<bool>,
    pub bin_level: Option<f64>,
    pub extra: serde_json::Value,
}

/// Sensor reading store.
#[derive(Clone)]
pub struct ReadingStore {
    ledger: Ledger,
}

impl ReadingStore {
    pub(crate) fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Persist a reading.
    pub fn insert(&self, new: NewReading) -> Result<SensorReading> {
        let txn = self.ledger.db().begin_write()?;
        let reading = {
            let mut meta = txn.open_table(META_TABLE)?;
            let id = codec::next_id(&mut meta, ID_KEY)?;
            drop(meta);

            let reading = SensorReading {
                id,
                device_id: new.device_id,
                ts: new.ts,
                current: new.current,
                gas_ppm: new.gas_ppm,
                flame: new.flame,
                bin_level: new.bin_level,
                extra: new.extra,
            };
            let mut table = txn.open_table(READINGS_TABLE)?;
            table.insert((new.device_id, id), codec::encode(&reading)?.as_str())?;
            reading
        };
        txn.commit()?;
        Ok(reading)
    }

    /// Most recent readings for one device, newest first.
    pub fn recent_for_device(&self, device_id: DeviceId, limit: usize) -> Result<Vec<SensorReading>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(READINGS_TABLE)?;
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

    fn reading(device_id: DeviceId, gas_ppm: f64) -> NewReading {
        NewReading {
            device_id,
            ts: Utc::now(),
            current: Some(0.4),
            gas_ppm: Some(gas_ppm),
            flame: Some(false),
            bin_level: None,
            extra: serde_json::json!({}),
        }
    }

    #[test]
    fn test_recent_is_newest_first_and_per_device() {
        let store = Ledger::ephemeral().unwrap().readings();
        store.insert(reading(1, 10.0)).unwrap();
        store.insert(reading(1, 20.0)).unwrap();
        store.insert(reading(2, 99.0)).unwrap();
        store.insert(reading(1, 30.0)).unwrap();

        let recent = store.recent_for_device(1, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].gas_ppm, Some(30.0));
        assert_eq!(recent[1].gas_ppm, Some(20.0));
        assert!(recent.iter().all(|r| r.device_id == 1));
    }

    #[test]
    fn test_extra_fields_preserved() {
        let store = Ledger::ephemeral().unwrap().readings();
        let mut new = reading(5, 1.0);
        new.extra = serde_json::json!({"rssi": -61});
        store.insert(new).unwrap();

        let recent = store.recent_for_device(5, 10).unwrap();
        assert_eq!(recent[0].extra["rssi"], -61);
    }
}

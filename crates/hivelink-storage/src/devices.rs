//! Device directory.
//!
//! Holds the fleet's identity and liveness records. The bridge mutates
//! liveness (online flag + last-seen) from authenticated inbound messages
//! and clears it from the offline sweeper; everything else is plain CRUD so
//! the bridge is operable end to end.

use chrono::{DateTime, Duration, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use hivelink_core::DeviceId;

use crate::codec::{self, META_TABLE};
use crate::error::Result;
use crate::Ledger;

// Devices table: key = device id, value = DeviceRecord (JSON)
pub(crate) const DEVICES_TABLE: TableDefinition<i64, &str> = TableDefinition::new("devices");

const ID_KEY: &str = "devices";

/// A registered device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Directory-allocated id. Appears as the topic segment on the wire.
    pub id: DeviceId,
    /// Display name.
    pub name: String,
    /// Shared secret presented by the device on every inbound message.
    pub device_key: String,
    /// MQTT client id last reported by the device, when known.
    pub mqtt_client_id: Option<String>,
    /// Whether the device is currently considered online.
    pub online: bool,
    /// Last time an authenticated message arrived from the device.
    pub last_seen: Option<DateTime<Utc>>,
    /// Soft-delete flag; deleted devices stop resolving.
    pub deleted: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Input for registering a device.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub name: String,
    pub device_key: String,
}

/// Device directory store.
#[derive(Clone)]
pub struct DeviceStore {
    ledger: Ledger,
}

impl DeviceStore {
    pub(crate) fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Register a device.
    pub fn create(&self, new: NewDevice) -> Result<DeviceRecord> {
        let txn = self.ledger.db().begin_write()?;
        let record = {
            let mut meta = txn.open_table(META_TABLE)?;
            let id = codec::next_id(&mut meta, ID_KEY)?;
            drop(meta);

            let record = DeviceRecord {
                id,
                name: new.name,
                device_key: new.device_key,
                mqtt_client_id: None,
                online: false,
                last_seen: None,
                deleted: false,
                created_at: Utc::now(),
            };
            let mut table = txn.open_table(DEVICES_TABLE)?;
            table.insert(id, codec::encode(&record)?.as_str())?;
            record
        };
        txn.commit()?;
        Ok(record)
    }

    /// Load a device by id. Soft-deleted devices still load; callers that
    /// must not see them check `deleted`.
    pub fn get(&self, id: DeviceId) -> Result<Option<DeviceRecord>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(DEVICES_TABLE)?;
        let raw = table.get(id)?.map(|g| g.value().to_string());
        raw.map(|r| codec::decode(&r)).transpose()
    }

    /// Load a device that exists and is not soft-deleted.
    pub fn get_active(&self, id: DeviceId) -> Result<Option<DeviceRecord>> {
        Ok(self.get(id)?.filter(|d| !d.deleted))
    }

    /// List all devices.
    pub fn list(&self) -> Result<Vec<DeviceRecord>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(DEVICES_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(codec::decode(value.value())?);
        }
        Ok(out)
    }

    /// Soft-delete a device.
    pub fn soft_delete(&self, id: DeviceId) -> Result<bool> {
        self.update(id, |record| {
            if record.deleted {
                return false;
            }
            record.deleted = true;
            true
        })
    }

    /// Heartbeat admission: one conditional update guarded by id + key.
    ///
    /// Sets online=true, last_seen=now and optionally the MQTT client id,
    /// but only when the device exists, is not deleted, and `device_key`
    /// matches. Zero rows affected (a `false` return) means key mismatch or
    /// unknown device; the caller drops the event with a warning.
    pub fn heartbeat_touch(
        &self,
        id: DeviceId,
        device_key: &str,
        mqtt_client_id: Option<String>,
    ) -> Result<bool> {
        self.update(id, |record| {
            if record.deleted || record.device_key != device_key {
                return false;
            }
            record.online = true;
            record.last_seen = Some(Utc::now());
            if let Some(client_id) = mqtt_client_id {
                record.mqtt_client_id = Some(client_id);
            }
            true
        })
    }

    /// Mark a device online with last_seen=now, without a key check.
    ///
    /// Used by the telemetry path, which has already loaded the record and
    /// compared the key itself.
    pub fn mark_seen(&self, id: DeviceId) -> Result<bool> {
        self.update(id, |record| {
            if record.deleted {
                return false;
            }
            record.online = true;
            record.last_seen = Some(Utc::now());
            true
        })
    }

    /// Clear the online flag for every device unseen past `threshold`.
    /// Returns the ids taken offline.
    ///
    /// The cutoff is computed here, at transaction time, so liveness data
    /// and sweep share a single clock.
    pub fn sweep_offline(&self, threshold: Duration) -> Result<Vec<DeviceId>> {
        let cutoff = Utc::now() - threshold;
        let txn = self.ledger.db().begin_write()?;
        let swept = {
            let mut table = txn.open_table(DEVICES_TABLE)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let record: DeviceRecord = codec::decode(value.value())?;
                let unseen = record.last_seen.map_or(true, |seen| seen < cutoff);
                if record.online && unseen {
                    stale.push(record);
                }
            }

            let mut swept = Vec::with_capacity(stale.len());
            for mut record in stale {
                record.online = false;
                table.insert(record.id, codec::encode(&record)?.as_str())?;
                swept.push(record.id);
            }
            swept
        };
        txn.commit()?;
        Ok(swept)
    }

    fn update<F>(&self, id: DeviceId, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut DeviceRecord) -> bool,
    {
        let txn = self.ledger.db().begin_write()?;
        let updated = {
            let mut table = txn.open_table(DEVICES_TABLE)?;
            let raw = table.get(id)?.map(|g| g.value().to_string());
            match raw {
                None => false,
                Some(raw) => {
                    let mut record: DeviceRecord = codec::decode(&raw)?;
                    if mutate(&mut record) {
                        table.insert(id, codec::encode(&record)?.as_str())?;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        txn.commit()?;
        Ok(updated)
    }
}

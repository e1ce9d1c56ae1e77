//! Persistent job/command ledger for HiveLink, backed by redb.
//!
//! One `Ledger` owns the database; per-domain stores (commands, OTA jobs,
//! device directory, firmware releases, sensor readings, alarms) share it.
//!
//! All cross-cutting state transitions in the bridge go through conditional
//! updates implemented here: every mutation that races with another writer
//! re-reads the record inside a write transaction, checks the expected prior
//! state, and either commits the new state or reports a zero-row match by
//! returning `false`. redb write transactions are serialized, which makes
//! that read-check-write sequence the only concurrency control the bridge
//! needs: last valid writer wins, everyone else becomes a silent no-op.

pub mod alarms;
pub mod commands;
pub mod devices;
pub mod error;
pub mod firmware;
pub mod ota;
pub mod readings;

mod codec;

use std::path::Path;
use std::sync::Arc;

use redb::Database;

pub use alarms::{Alarm, AlarmKind, AlarmStore, NewAlarm};
pub use commands::{AckOutcome, Command, CommandSource, CommandStatus, CommandStore, NewCommand};
pub use devices::{DeviceRecord, DeviceStore, NewDevice};
pub use error::{Error, Result};
pub use firmware::{FirmwareRelease, FirmwareStore, NewRelease};
pub use ota::{OtaJob, OtaProgressUpdate, OtaStatus, OtaStore, OtaTimeout};
pub use readings::{NewReading, ReadingStore, SensorReading};

/// The shared ledger database.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
}

impl Ledger {
    /// Open (or create) the ledger at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };
        let ledger = Self { db: Arc::new(db) };
        ledger.init_tables()?;
        Ok(ledger)
    }

    /// Open a throwaway ledger in the system temp directory.
    ///
    /// redb has no true in-memory mode, so this backs the database with a
    /// uniquely-named temp file. Intended for tests and local runs.
    pub fn ephemeral() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("hivelink_{}.redb", uuid::Uuid::new_v4()));
        Self::open(path)
    }

    /// Ensure all tables exist so later read transactions never fail on a
    /// missing table.
    fn init_tables(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let _ = txn.open_table(codec::META_TABLE)?;
            let _ = txn.open_table(commands::COMMANDS_TABLE)?;
            let _ = txn.open_table(ota::OTA_JOBS_TABLE)?;
            let _ = txn.open_table(devices::DEVICES_TABLE)?;
            let _ = txn.open_table(firmware::RELEASES_TABLE)?;
            let _ = txn.open_table(readings::READINGS_TABLE)?;
            let _ = txn.open_table(alarms::ALARMS_TABLE)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Command ledger.
    pub fn commands(&self) -> CommandStore {
        CommandStore::new(self.clone())
    }

    /// OTA job ledger.
    pub fn ota(&self) -> OtaStore {
        OtaStore::new(self.clone())
    }

    /// Device directory.
    pub fn devices(&self) -> DeviceStore {
        DeviceStore::new(self.clone())
    }

    /// Firmware release store.
    pub fn firmware(&self) -> FirmwareStore {
        FirmwareStore::new(self.clone())
    }

    /// Sensor reading store.
    pub fn readings(&self) -> ReadingStore {
        ReadingStore::new(self.clone())
    }

    /// Alarm store.
    pub fn alarms(&self) -> AlarmStore {
        AlarmStore::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.redb");

        {
            let ledger = Ledger::open(&path).unwrap();
            ledger
                .devices()
                .create(NewDevice {
                    name: "kitchen-bin".into(),
                    device_key: "k1".into(),
                })
                .unwrap();
        }

        let ledger = Ledger::open(&path).unwrap();
        let devices = ledger.devices().list().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "kitchen-bin");
    }

    #[test]
    fn test_ephemeral_ledger_is_empty() {
        let ledger = Ledger::ephemeral().unwrap();
        assert!(ledger.commands().get(1).unwrap().is_none());
        assert!(ledger.devices().list().unwrap().is_empty());
    }
}

//! Firmware release store.
//!
//! Resolves a release id to the binary metadata an OTA notification embeds:
//! checksum, size and download URL. Binary upload itself happens elsewhere;
//! this store only records and resolves the metadata.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use hivelink_core::ReleaseId;

use crate::codec::{self, META_TABLE};
use crate::error::Result;
use crate::Ledger;

// Releases table: key = release id, value = FirmwareRelease (JSON)
pub(crate) const RELEASES_TABLE: TableDefinition<i64, &str> = TableDefinition::new("firmware_releases");

const ID_KEY: &str = "firmware_releases";

/// Metadata for one published firmware build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareRelease {
    /// Store-allocated id.
    pub id: ReleaseId,
    /// Semantic version string, e.g. "1.4.2".
    pub version: String,
    /// Hex-encoded digest of the binary.
    pub checksum: String,
    /// Binary size in bytes.
    pub size_bytes: u64,
    /// Where the device fetches the binary from.
    pub download_url: String,
    /// Soft-delete flag; deleted releases stop resolving for OTA triggers.
    pub deleted: bool,
    /// Publication time.
    pub created_at: DateTime<Utc>,
}

/// Input for publishing a release.
#[derive(Debug, Clone)]
pub struct NewRelease {
    pub version: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub download_url: String,
}

/// Firmware release store.
#[derive(Clone)]
pub struct FirmwareStore {
    ledger: Ledger,
}

impl FirmwareStore {
    pub(crate) fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Publish a release.
    pub fn create(&self, new: NewRelease) -> Result<FirmwareRelease> {
        let txn = self.ledger.db().begin_write()?;
        let release = {
            let mut meta = txn.open_table(META_TABLE)?;
            let id = codec::next_id(&mut meta, ID_KEY)?;
            drop(meta);

            let release = FirmwareRelease {
                id,
                version: new.version,
                checksum: new.checksum,
                size_bytes: new.size_bytes,
                download_url: new.download_url,
                deleted: false,
                created_at: Utc::now(),
            };
            let mut table = txn.open_table(RELEASES_TABLE)?;
            table.insert(id, codec::encode(&release)?.as_str())?;
            release
        };
        txn.commit()?;
        Ok(release)
    }

    /// Load a release by id.
    pub fn get(&self, id: ReleaseId) -> Result<Option<FirmwareRelease>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(RELEASES_TABLE)?;
        let raw = table.get(id)?.map(|g| g.value().to_string());
        raw.map(|r| codec::decode(&r)).transpose()
    }

    /// Load a release that exists and is not soft-deleted.
    pub fn get_active(&self, id: ReleaseId) -> Result<Option<FirmwareRelease>> {
        Ok(self.get(id)?.filter(|r| !r.deleted))
    }

    /// List all releases.
    pub fn list(&self) -> Result<Vec<FirmwareRelease>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(RELEASES_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(codec::decode(value.value())?);
        }
        Ok(out)
    }

    /// Soft-delete a release.
    pub fn soft_delete(&self, id: ReleaseId) -> Result<bool> {
        let txn = self.ledger.db().begin_write()?;
        let updated = {
            let mut table = txn.open_table(RELEASES_TABLE)?;
            let raw = table.get(id)?.map(|g| g.value().to_string());
            match raw {
                None => false,
                Some(raw) => {
                    let mut release: FirmwareRelease = codec::decode(&raw)?;
                    if release.deleted {
                        false
                    } else {
                        release.deleted = true;
                        table.insert(id, codec::encode(&release)?.as_str())?;
                        true
                    }
                }
            }
        };
        txn.commit()?;
        Ok(updated)
    }
}

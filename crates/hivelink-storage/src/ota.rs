//! OTA job ledger.
//!
//! One OtaJob is one firmware-update attempt for one device, always linked
//! to the `OTA_UPDATE` Command used to notify the device. Milestone
//! timestamps are set at most once, in lifecycle order; progress reports are
//! applied last-writer-wins by job id (device-side reports arrive in a
//! single well-ordered stream per job in practice).

use chrono::{DateTime, Duration, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use hivelink_core::{CommandId, DeviceId, OtaJobId, ReleaseId};

use crate::codec::{self, META_TABLE};
use crate::commands::{self, Command, CommandStatus, NewCommand, COMMANDS_TABLE};
use crate::error::Result;
use crate::Ledger;

// OTA jobs table: key = job id, value = OtaJob (JSON)
pub(crate) const OTA_JOBS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("ota_jobs");

const ID_KEY: &str = "ota_jobs";
const COMMAND_ID_KEY: &str = "commands";

/// OTA job lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtaStatus {
    /// Job created, notification command not yet dispatched.
    Pending,
    /// Notification command published to the device.
    Sent,
    /// Device reported it is downloading the image.
    Downloading,
    /// Device reported the image applied.
    Applied,
    /// Dispatch failed or the device reported failure.
    Failed,
    /// The sweep worker gave up on a stuck job.
    Timeout,
}

impl OtaStatus {
    /// Whether this status ends the job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OtaStatus::Applied | OtaStatus::Failed | OtaStatus::Timeout
        )
    }

    /// Status as the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaStatus::Pending => "PENDING",
            OtaStatus::Sent => "SENT",
            OtaStatus::Downloading => "DOWNLOADING",
            OtaStatus::Applied => "APPLIED",
            OtaStatus::Failed => "FAILED",
            OtaStatus::Timeout => "TIMEOUT",
        }
    }
}

/// One firmware-update attempt for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaJob {
    /// Ledger-allocated id.
    pub id: OtaJobId,
    /// Target device.
    pub device_id: DeviceId,
    /// Firmware release being installed.
    pub release_id: ReleaseId,
    /// Current lifecycle status.
    pub status: OtaStatus,
    /// Download progress in `[0, 1]`, when reported.
    pub progress: Option<f64>,
    /// Last diagnostic recorded for this job.
    pub last_error: Option<String>,
    /// When the notification command was dispatched.
    pub sent_at: Option<DateTime<Utc>>,
    /// When the device first reported downloading.
    pub downloading_at: Option<DateTime<Utc>>,
    /// When the device reported the image applied.
    pub applied_at: Option<DateTime<Utc>>,
    /// When the job failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// The Command used to notify the device.
    pub command_id: CommandId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// A device-reported progress update.
#[derive(Debug, Clone, PartialEq)]
pub enum OtaProgressUpdate {
    /// Download in progress, with an optional fraction in `[0, 1]`.
    Downloading { progress: Option<f64> },
    /// Image applied. Forces progress to 1.0.
    Applied,
    /// Update failed on the device.
    Failed { error: Option<String> },
}

/// Result of one swept OTA job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaTimeout {
    /// The job forced to `Timeout`.
    pub job_id: OtaJobId,
    /// Its linked command.
    pub command_id: CommandId,
    /// Whether the linked command was still live and got cascaded.
    pub command_cascaded: bool,
}

/// OTA job ledger store.
#[derive(Clone)]
pub struct OtaStore {
    ledger: Ledger,
}

impl OtaStore {
    pub(crate) fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Atomically create an OTA job in `Pending` together with its linked
    /// notification command. Both rows commit or neither does.
    pub fn create_with_command(
        &self,
        device_id: DeviceId,
        release_id: ReleaseId,
        command: NewCommand,
    ) -> Result<(OtaJob, Command)> {
        let txn = self.ledger.db().begin_write()?;
        let (job, command) = {
            let mut meta = txn.open_table(META_TABLE)?;
            let command_id = codec::next_id(&mut meta, COMMAND_ID_KEY)?;
            let job_id = codec::next_id(&mut meta, ID_KEY)?;
            drop(meta);

            let command = commands::build_command(command_id, command);
            let mut commands_table = txn.open_table(COMMANDS_TABLE)?;
            commands_table.insert(command_id, codec::encode(&command)?.as_str())?;
            drop(commands_table);

            let now = Utc::now();
            let job = OtaJob {
                id: job_id,
                device_id,
                release_id,
                status: OtaStatus::Pending,
                progress: None,
                last_error: None,
                sent_at: None,
                downloading_at: None,
                applied_at: None,
                failed_at: None,
                command_id,
                created_at: now,
                updated_at: now,
            };
            let mut jobs_table = txn.open_table(OTA_JOBS_TABLE)?;
            jobs_table.insert(job_id, codec::encode(&job)?.as_str())?;
            (job, command)
        };
        txn.commit()?;
        Ok((job, command))
    }

    /// Load a job by id.
    pub fn get(&self, id: OtaJobId) -> Result<Option<OtaJob>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(OTA_JOBS_TABLE)?;
        let raw = table.get(id)?.map(|g| g.value().to_string());
        raw.map(|r| codec::decode(&r)).transpose()
    }

    /// List all jobs for one device, oldest first.
    pub fn list_for_device(&self, device_id: DeviceId) -> Result<Vec<OtaJob>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(OTA_JOBS_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let job: OtaJob = codec::decode(value.value())?;
            if job.device_id == device_id {
                out.push(job);
            }
        }
        Ok(out)
    }

    /// `Pending → Sent` after the notification command dispatched.
    pub fn mark_sent(&self, id: OtaJobId) -> Result<bool> {
        self.update(id, |job| {
            if job.status != OtaStatus::Pending {
                return false;
            }
            job.status = OtaStatus::Sent;
            job.sent_at.get_or_insert_with(Utc::now);
            true
        })
    }

    /// `Pending → Failed` when the notification command could not be
    /// dispatched.
    pub fn mark_dispatch_failed(&self, id: OtaJobId, error: &str) -> Result<bool> {
        self.update(id, |job| {
            if job.status != OtaStatus::Pending {
                return false;
            }
            job.status = OtaStatus::Failed;
            job.failed_at.get_or_insert_with(Utc::now);
            job.last_error = Some(error.to_string());
            true
        })
    }

    /// Apply a device-reported progress update, last-writer-wins by job id.
    ///
    /// There is deliberately no terminal-state guard here; milestones stay
    /// set-once, progress never regresses, and out-of-range fractions leave
    /// the stored value unchanged. Returns `false` only when the job does
    /// not exist.
    pub fn apply_progress(&self, id: OtaJobId, update: OtaProgressUpdate) -> Result<bool> {
        self.update(id, |job| {
            match update {
                OtaProgressUpdate::Downloading { progress } => {
                    job.status = OtaStatus::Downloading;
                    job.downloading_at.get_or_insert_with(Utc::now);
                    if let Some(p) = progress {
                        if (0.0..=1.0).contains(&p) && job.progress.map_or(true, |old| p >= old) {
                            job.progress = Some(p);
                        }
                    }
                }
                OtaProgressUpdate::Applied => {
                    job.status = OtaStatus::Applied;
                    job.applied_at.get_or_insert_with(Utc::now);
                    job.progress = Some(1.0);
                }
                OtaProgressUpdate::Failed { error } => {
                    job.status = OtaStatus::Failed;
                    job.failed_at.get_or_insert_with(Utc::now);
                    if let Some(e) = error {
                        job.last_error = Some(e);
                    }
                }
            }
            true
        })
    }

    /// Force `Timeout` on every job stuck in `Sent`/`Downloading` with no
    /// activity since `now - ota_timeout`, cascading `Timeout` to the linked
    /// command when it is still `Pending`/`Sent`. Job and command writes
    /// share one transaction.
    pub fn sweep_timeouts(&self, ota_timeout: Duration) -> Result<Vec<OtaTimeout>> {
        let cutoff = Utc::now() - ota_timeout;
        let txn = self.ledger.db().begin_write()?;
        let swept = {
            let mut jobs_table = txn.open_table(OTA_JOBS_TABLE)?;
            let mut stuck = Vec::new();
            for entry in jobs_table.iter()? {
                let (_, value) = entry?;
                let job: OtaJob = codec::decode(value.value())?;
                if matches!(job.status, OtaStatus::Sent | OtaStatus::Downloading)
                    && job.updated_at < cutoff
                {
                    stuck.push(job);
                }
            }

            let mut commands_table = txn.open_table(COMMANDS_TABLE)?;
            let mut swept = Vec::with_capacity(stuck.len());
            for mut job in stuck {
                job.status = OtaStatus::Timeout;
                job.updated_at = Utc::now();
                jobs_table.insert(job.id, codec::encode(&job)?.as_str())?;

                let raw = commands_table
                    .get(job.command_id)?
                    .map(|g| g.value().to_string());
                let command_cascaded = match raw {
                    Some(raw) => {
                        let mut command: Command = codec::decode(&raw)?;
                        if matches!(
                            command.status,
                            CommandStatus::Pending | CommandStatus::Sent
                        ) {
                            command.status = CommandStatus::Timeout;
                            command.updated_at = Utc::now();
                            commands_table
                                .insert(command.id, codec::encode(&command)?.as_str())?;
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                };

                swept.push(OtaTimeout {
                    job_id: job.id,
                    command_id: job.command_id,
                    command_cascaded,
                });
            }
            swept
        };
        txn.commit()?;
        Ok(swept)
    }

    fn update<F>(&self, id: OtaJobId, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut OtaJob) -> bool,
    {
        let txn = self.ledger.db().begin_write()?;
        let updated = {
            let mut table = txn.open_table(OTA_JOBS_TABLE)?;
            let raw = table.get(id)?.map(|g| g.value().to_string());
            match raw {
                None => false,
                Some(raw) => {
                    let mut job: OtaJob = codec::decode(&raw)?;
                    if mutate(&mut job) {
                        job.updated_at = Utc::now();
                        table.insert(id, codec::encode(&job)?.as_str())?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandSource;

    fn ledger() -> Ledger {
        Ledger::ephemeral().unwrap()
    }

    fn ota_command(device_id: DeviceId) -> NewCommand {
        NewCommand {
            device_id,
            kind: "OTA_UPDATE".into(),
            payload: serde_json::json!({"releaseId": 3}),
            source: CommandSource::Admin,
            requested_by: None,
        }
    }

    #[test]
    fn test_create_links_command() {
        let ledger = ledger();
        let (job, command) = ledger
            .ota()
            .create_with_command(7, 3, ota_command(7))
            .unwrap();

        assert_eq!(job.status, OtaStatus::Pending);
        assert_eq!(job.command_id, command.id);
        assert_eq!(command.kind, "OTA_UPDATE");

        // Both rows are visible through their own stores.
        assert!(ledger.ota().get(job.id).unwrap().is_some());
        assert!(ledger.commands().get(command.id).unwrap().is_some());
    }

    #[test]
    fn test_milestones_set_once() {
        let ledger = ledger();
        let store = ledger.ota();
        let (job, _) = store.create_with_command(7, 3, ota_command(7)).unwrap();

        store.mark_sent(job.id).unwrap();
        let sent_at = store.get(job.id).unwrap().unwrap().sent_at.unwrap();

        store
            .apply_progress(job.id, OtaProgressUpdate::Downloading { progress: Some(0.2) })
            .unwrap();
        let downloading_at = store.get(job.id).unwrap().unwrap().downloading_at.unwrap();

        store
            .apply_progress(job.id, OtaProgressUpdate::Downloading { progress: Some(0.6) })
            .unwrap();
        let reread = store.get(job.id).unwrap().unwrap();
        assert_eq!(reread.sent_at.unwrap(), sent_at);
        assert_eq!(reread.downloading_at.unwrap(), downloading_at);
        assert_eq!(reread.progress, Some(0.6));
    }

    #[test]
    fn test_out_of_range_progress_ignored() {
        let ledger = ledger();
        let store = ledger.ota();
        let (job, _) = store.create_with_command(7, 3, ota_command(7)).unwrap();
        store.mark_sent(job.id).unwrap();

        store
            .apply_progress(job.id, OtaProgressUpdate::Downloading { progress: Some(1.5) })
            .unwrap();
        assert_eq!(store.get(job.id).unwrap().unwrap().progress, None);

        store
            .apply_progress(job.id, OtaProgressUpdate::Downloading { progress: Some(-0.1) })
            .unwrap();
        assert_eq!(store.get(job.id).unwrap().unwrap().progress, None);

        store
            .apply_progress(job.id, OtaProgressUpdate::Downloading { progress: Some(0.4) })
            .unwrap();
        assert_eq!(store.get(job.id).unwrap().unwrap().progress, Some(0.4));

        // A regression is dropped too; last good value stands.
        store
            .apply_progress(job.id, OtaProgressUpdate::Downloading { progress: Some(0.1) })
            .unwrap();
        assert_eq!(store.get(job.id).unwrap().unwrap().progress, Some(0.4));
    }

    #[test]
    fn test_applied_forces_full_progress() {
        let ledger = ledger();
        let store = ledger.ota();
        let (job, _) = store.create_with_command(7, 3, ota_command(7)).unwrap();
        store.mark_sent(job.id).unwrap();

        store
            .apply_progress(job.id, OtaProgressUpdate::Downloading { progress: Some(0.3) })
            .unwrap();
        store.apply_progress(job.id, OtaProgressUpdate::Applied).unwrap();

        let done = store.get(job.id).unwrap().unwrap();
        assert_eq!(done.status, OtaStatus::Applied);
        assert_eq!(done.progress, Some(1.0));
        assert!(done.applied_at.is_some());
    }

    #[test]
    fn test_dispatch_failed_records_error() {
        let ledger = ledger();
        let store = ledger.ota();
        let (job, _) = store.create_with_command(7, 3, ota_command(7)).unwrap();

        assert!(store.mark_dispatch_failed(job.id, "not connected").unwrap());
        let failed = store.get(job.id).unwrap().unwrap();
        assert_eq!(failed.status, OtaStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("not connected"));
        assert!(failed.failed_at.is_some());

        // Guard: only from Pending.
        assert!(!store.mark_dispatch_failed(job.id, "again").unwrap());
    }

    #[test]
    fn test_sweep_cascades_to_live_command() {
        let ledger = ledger();
        let store = ledger.ota();
        let commands = ledger.commands();

        let (job, command) = store.create_with_command(7, 3, ota_command(7)).unwrap();
        store.mark_sent(job.id).unwrap();
        commands.mark_sent(command.id).unwrap();

        // Zero timeout: everything Sent is stuck.
        let swept = store.sweep_timeouts(Duration::zero()).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].job_id, job.id);
        assert!(swept[0].command_cascaded);

        assert_eq!(
            store.get(job.id).unwrap().unwrap().status,
            OtaStatus::Timeout
        );
        assert_eq!(
            commands.get(command.id).unwrap().unwrap().status,
            CommandStatus::Timeout
        );

        // Idempotent: a second sweep matches nothing.
        assert!(store.sweep_timeouts(Duration::zero()).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_leaves_terminal_command_alone() {
        let ledger = ledger();
        let store = ledger.ota();
        let commands = ledger.commands();

        let (job, command) = store.create_with_command(7, 3, ota_command(7)).unwrap();
        store.mark_sent(job.id).unwrap();
        commands.mark_sent(command.id).unwrap();
        commands
            .apply_ack(command.id, crate::AckOutcome::Acked, None)
            .unwrap();

        let swept = store.sweep_timeouts(Duration::zero()).unwrap();
        assert_eq!(swept.len(), 1);
        assert!(!swept[0].command_cascaded);
        assert_eq!(
            commands.get(command.id).unwrap().unwrap().status,
            CommandStatus::Acked
        );
    }
}

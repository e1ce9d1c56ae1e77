//! OTA orchestration.
//!
//! `Pending → Sent → Downloading → Applied | Failed | Timeout`. Triggering
//! creates the job and its notification command atomically, then rides the
//! normal dispatch path; from there the device drives the job through
//! progress reports on its own topic.

use tracing::{debug, info, warn};

use hivelink_core::{CommandId, DeviceId, Error, OtaJobId, ReleaseId};
use hivelink_storage::{
    CommandSource, NewCommand, OtaProgressUpdate, OtaStatus, OtaStore,
};

use crate::dispatch::{CommandDispatcher, DispatchOutcome};
use crate::messages::OtaProgressMessage;

/// What `trigger` hands back to the HTTP-facing caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaTicket {
    pub ota_job_id: OtaJobId,
    pub command_id: CommandId,
    pub status: OtaStatus,
}

/// Creates and advances OTA jobs.
#[derive(Clone)]
pub struct OtaOrchestrator {
    devices: hivelink_storage::DeviceStore,
    firmware: hivelink_storage::FirmwareStore,
    ota: OtaStore,
    dispatcher: CommandDispatcher,
}

impl OtaOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        devices: hivelink_storage::DeviceStore,
        firmware: hivelink_storage::FirmwareStore,
        ota: OtaStore,
        dispatcher: CommandDispatcher,
    ) -> Self {
        Self {
            devices,
            firmware,
            ota,
            dispatcher,
        }
    }

    /// Start a firmware update for one device.
    ///
    /// Validates device and release, atomically creates the job plus its
    /// linked `OTA_UPDATE` command, then dispatches the command. The job
    /// ends up `Sent` or `Failed` depending on the dispatch outcome.
    pub async fn trigger(
        &self,
        device_id: DeviceId,
        release_id: ReleaseId,
        requested_by: Option<String>,
    ) -> Result<OtaTicket, Error> {
        self.devices
            .get_active(device_id)
            .map_err(Error::from)?
            .ok_or_else(|| Error::device_not_found(device_id))?;
        let release = self
            .firmware
            .get_active(release_id)
            .map_err(Error::from)?
            .ok_or_else(|| Error::release_not_found(release_id))?;

        let payload = serde_json::json!({
            "releaseId": release.id,
            "version": release.version,
            "checksum": release.checksum,
            "sizeBytes": release.size_bytes,
            "downloadUrl": release.download_url,
        });
        let (job, command) = self
            .ota
            .create_with_command(
                device_id,
                release_id,
                NewCommand {
                    device_id,
                    kind: "OTA_UPDATE".into(),
                    payload,
                    source: CommandSource::Admin,
                    requested_by,
                },
            )
            .map_err(Error::from)?;
        info!(
            ota_job_id = job.id,
            command_id = command.id,
            device_id,
            release_id,
            "ota job created"
        );

        let status = match self.dispatcher.dispatch(command.id).await? {
            DispatchOutcome::Sent => {
                self.ota.mark_sent(job.id).map_err(Error::from)?;
                OtaStatus::Sent
            }
            DispatchOutcome::Failed { error } => {
                self.ota
                    .mark_dispatch_failed(job.id, &error)
                    .map_err(Error::from)?;
                OtaStatus::Failed
            }
            DispatchOutcome::NotPending => {
                // The command was advanced under us before dispatch ran;
                // leave the job as the ledger has it.
                warn!(ota_job_id = job.id, "ota command advanced before dispatch");
                self.ota
                    .get(job.id)
                    .map_err(Error::from)?
                    .map(|j| j.status)
                    .unwrap_or(OtaStatus::Pending)
            }
        };

        Ok(OtaTicket {
            ota_job_id: job.id,
            command_id: command.id,
            status,
        })
    }
}

/// Applies device-reported OTA progress to the job ledger.
#[derive(Clone)]
pub struct OtaProgressHandler {
    ota: OtaStore,
}

impl OtaProgressHandler {
    /// Create a progress handler.
    pub fn new(ota: OtaStore) -> Self {
        Self { ota }
    }

    /// Handle one raw progress payload from `device_id`'s OTA topic.
    pub fn handle(&self, device_id: DeviceId, payload: &[u8]) {
        let msg: OtaProgressMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(device_id, "dropping malformed ota progress: {e}");
                return;
            }
        };

        let update = match msg.status.as_str() {
            "DOWNLOADING" => OtaProgressUpdate::Downloading {
                progress: msg.progress,
            },
            "APPLIED" => OtaProgressUpdate::Applied,
            "FAILED" => OtaProgressUpdate::Failed { error: msg.error },
            other => {
                warn!(device_id, ota_job_id = msg.ota_job_id, status = other, "dropping unknown ota status");
                return;
            }
        };

        match self.ota.apply_progress(msg.ota_job_id, update) {
            Ok(true) => debug!(device_id, ota_job_id = msg.ota_job_id, status = %msg.status, "ota progress applied"),
            Ok(false) => info!(device_id, ota_job_id = msg.ota_job_id, "ota progress ignored: unknown job"),
            Err(e) => warn!(device_id, ota_job_id = msg.ota_job_id, "ota progress update failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    use hivelink_bus::{MessagePublisher, Qos};
    use hivelink_core::RetryPolicy;
    use hivelink_storage::{CommandStatus, Ledger, NewDevice, NewRelease};

    struct OkPublisher;

    #[async_trait]
    impl MessagePublisher for OkPublisher {
        async fn publish(&self, _: &str, _: Vec<u8>, _: Qos) -> hivelink_bus::Result<()> {
            Ok(())
        }
    }

    struct DownPublisher;

    #[async_trait]
    impl MessagePublisher for DownPublisher {
        async fn publish(&self, _: &str, _: Vec<u8>, _: Qos) -> hivelink_bus::Result<()> {
            Err(hivelink_bus::BusError::Rejected("broker down".into()))
        }
    }

    fn orchestrator(ledger: &Ledger, publisher: Arc<dyn MessagePublisher>) -> OtaOrchestrator {
        let dispatcher =
            CommandDispatcher::new(ledger.commands(), publisher, RetryPolicy::none());
        OtaOrchestrator::new(ledger.devices(), ledger.firmware(), ledger.ota(), dispatcher)
    }

    fn seed(ledger: &Ledger) -> (i64, i64) {
        let device = ledger
            .devices()
            .create(NewDevice {
                name: "bin-7".into(),
                device_key: "k".into(),
            })
            .unwrap();
        let release = ledger
            .firmware()
            .create(NewRelease {
                version: "2.0.0".into(),
                checksum: "abcd".into(),
                size_bytes: 1024,
                download_url: "https://fw.example.com/2.0.0.bin".into(),
            })
            .unwrap();
        (device.id, release.id)
    }

    #[tokio::test]
    async fn test_trigger_happy_path() {
        let ledger = Ledger::ephemeral().unwrap();
        let orchestrator = orchestrator(&ledger, Arc::new(OkPublisher));
        let (device_id, release_id) = seed(&ledger);

        let ticket = orchestrator
            .trigger(device_id, release_id, Some("op".into()))
            .await
            .unwrap();
        assert_eq!(ticket.status, OtaStatus::Sent);

        let job = ledger.ota().get(ticket.ota_job_id).unwrap().unwrap();
        assert_eq!(job.status, OtaStatus::Sent);
        assert!(job.sent_at.is_some());

        let command = ledger.commands().get(ticket.command_id).unwrap().unwrap();
        assert_eq!(command.status, CommandStatus::Sent);
        assert_eq!(command.kind, "OTA_UPDATE");
        assert_eq!(command.payload["checksum"], "abcd");
        assert_eq!(command.payload["downloadUrl"], "https://fw.example.com/2.0.0.bin");
    }

    #[tokio::test]
    async fn test_trigger_unknown_device_and_release() {
        let ledger = Ledger::ephemeral().unwrap();
        let orchestrator = orchestrator(&ledger, Arc::new(OkPublisher));
        let (device_id, release_id) = seed(&ledger);

        let err = orchestrator.trigger(999, release_id, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "device", .. }));

        let err = orchestrator.trigger(device_id, 999, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound {
                kind: "firmware release",
                ..
            }
        ));

        // Nothing was created for either failed trigger.
        assert!(ledger.ota().list_for_device(device_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_soft_deleted_release_rejected() {
        let ledger = Ledger::ephemeral().unwrap();
        let orchestrator = orchestrator(&ledger, Arc::new(OkPublisher));
        let (device_id, release_id) = seed(&ledger);
        ledger.firmware().soft_delete(release_id).unwrap();

        let err = orchestrator.trigger(device_id, release_id, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_trigger_dispatch_failure_fails_job() {
        let ledger = Ledger::ephemeral().unwrap();
        let orchestrator = orchestrator(&ledger, Arc::new(DownPublisher));
        let (device_id, release_id) = seed(&ledger);

        let ticket = orchestrator.trigger(device_id, release_id, None).await.unwrap();
        assert_eq!(ticket.status, OtaStatus::Failed);

        let job = ledger.ota().get(ticket.ota_job_id).unwrap().unwrap();
        assert_eq!(job.status, OtaStatus::Failed);
        assert!(job.failed_at.is_some());
        assert!(job.last_error.is_some());
    }

    #[tokio::test]
    async fn test_progress_flow() {
        let ledger = Ledger::ephemeral().unwrap();
        let orchestrator = orchestrator(&ledger, Arc::new(OkPublisher));
        let (device_id, release_id) = seed(&ledger);
        let ticket = orchestrator.trigger(device_id, release_id, None).await.unwrap();

        let handler = OtaProgressHandler::new(ledger.ota());
        let job_id = ticket.ota_job_id;

        handler.handle(
            device_id,
            format!(r#"{{"otaJobId": {job_id}, "status": "DOWNLOADING", "progress": 0.5}}"#)
                .as_bytes(),
        );
        let job = ledger.ota().get(job_id).unwrap().unwrap();
        assert_eq!(job.status, OtaStatus::Downloading);
        assert_eq!(job.progress, Some(0.5));

        // Out-of-range report leaves progress untouched.
        handler.handle(
            device_id,
            format!(r#"{{"otaJobId": {job_id}, "status": "DOWNLOADING", "progress": 7.0}}"#)
                .as_bytes(),
        );
        assert_eq!(ledger.ota().get(job_id).unwrap().unwrap().progress, Some(0.5));

        handler.handle(
            device_id,
            format!(r#"{{"otaJobId": {job_id}, "status": "APPLIED"}}"#).as_bytes(),
        );
        let job = ledger.ota().get(job_id).unwrap().unwrap();
        assert_eq!(job.status, OtaStatus::Applied);
        assert_eq!(job.progress, Some(1.0));

        // Unknown status and garbage are dropped without effect.
        handler.handle(
            device_id,
            format!(r#"{{"otaJobId": {job_id}, "status": "REBOOTING"}}"#).as_bytes(),
        );
        handler.handle(device_id, b"garbage");
        assert_eq!(
            ledger.ota().get(job_id).unwrap().unwrap().status,
            OtaStatus::Applied
        );
    }

    #[tokio::test]
    async fn test_progress_failure_records_error() {
        let ledger = Ledger::ephemeral().unwrap();
        let orchestrator = orchestrator(&ledger, Arc::new(OkPublisher));
        let (device_id, release_id) = seed(&ledger);
        let ticket = orchestrator.trigger(device_id, release_id, None).await.unwrap();

        let handler = OtaProgressHandler::new(ledger.ota());
        let job_id = ticket.ota_job_id;
        handler.handle(
            device_id,
            format!(r#"{{"otaJobId": {job_id}, "status": "FAILED", "error": "checksum mismatch"}}"#)
                .as_bytes(),
        );

        let job = ledger.ota().get(job_id).unwrap().unwrap();
        assert_eq!(job.status, OtaStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("checksum mismatch"));
        assert!(job.failed_at.is_some());
    }
}

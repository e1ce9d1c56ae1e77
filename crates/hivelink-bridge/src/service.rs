//! Bridge service wiring.
//!
//! Owns the handlers, the consumer loop and the sweepers, and exposes the
//! typed service API the HTTP layer calls. Subscriptions are established
//! exactly once, inside `start`; there is no runtime "subscribed once"
//! flag to race on, because `start` hands the running tasks back as a
//! [`BridgeRuntime`] that only exists once the subscriptions are in place.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use hivelink_bus::{
    BusClient, InboundMessage, MessagePublisher, ParsedTopic, Qos, TopicKind,
    REGISTER_REQUEST_TOPIC,
};
use hivelink_core::{
    BridgeConfig, CommandId, DeviceId, Error, OtaJobId, ReleaseId,
};
use hivelink_storage::{
    Command, CommandSource, Ledger, NewCommand, OtaJob,
};

use crate::ack::AckHandler;
use crate::dispatch::CommandDispatcher;
use crate::ingest::IngestHandler;
use crate::ota::{OtaOrchestrator, OtaProgressHandler, OtaTicket};
use crate::provision::ProvisionHandler;
use crate::sweep::{
    start_command_sweeper, start_offline_sweeper, start_ota_sweeper, SweeperHandle,
};

/// The assembled bridge.
#[derive(Clone)]
pub struct BridgeService {
    config: BridgeConfig,
    ledger: Ledger,
    dispatcher: CommandDispatcher,
    ack: AckHandler,
    ota: OtaOrchestrator,
    ota_progress: OtaProgressHandler,
    ingest: IngestHandler,
    provision: ProvisionHandler,
}

/// Running background tasks owned by a started bridge.
pub struct BridgeRuntime {
    consumer: JoinHandle<()>,
    sweepers: Vec<SweeperHandle>,
}

impl BridgeRuntime {
    /// Stop sweepers and the consumer loop.
    pub async fn shutdown(self) {
        for sweeper in self.sweepers {
            sweeper.stop().await;
        }
        self.consumer.abort();
        let _ = self.consumer.await;
        info!("bridge runtime stopped");
    }
}

impl BridgeService {
    /// Assemble the bridge from its collaborators.
    pub fn new(config: BridgeConfig, ledger: Ledger, publisher: Arc<dyn MessagePublisher>) -> Self {
        let dispatcher = CommandDispatcher::new(
            ledger.commands(),
            publisher.clone(),
            config.publish_retry.clone(),
        );
        let ack = AckHandler::new(ledger.commands());
        let ota = OtaOrchestrator::new(
            ledger.devices(),
            ledger.firmware(),
            ledger.ota(),
            dispatcher.clone(),
        );
        let ota_progress = OtaProgressHandler::new(ledger.ota());
        let ingest = IngestHandler::new(
            ledger.devices(),
            ledger.readings(),
            ledger.alarms(),
            config.thresholds.clone(),
        );
        let provision = ProvisionHandler::new(ledger.commands(), dispatcher.clone(), publisher);

        Self {
            config,
            ledger,
            dispatcher,
            ack,
            ota,
            ota_progress,
            ingest,
            provision,
        }
    }

    /// Subscribe the device-facing topics and start the consumer loop plus
    /// the three sweepers.
    pub async fn start(
        &self,
        client: &BusClient,
        inbound: mpsc::Receiver<InboundMessage>,
    ) -> Result<BridgeRuntime, Error> {
        for kind in [
            TopicKind::CommandAck,
            TopicKind::Heartbeat,
            TopicKind::Telemetry,
            TopicKind::OtaProgress,
        ] {
            client
                .subscribe(&kind.wildcard(), Qos::AtLeastOnce)
                .await
                .map_err(Error::from)?;
        }
        client
            .subscribe(REGISTER_REQUEST_TOPIC, Qos::AtLeastOnce)
            .await
            .map_err(Error::from)?;
        info!("bridge subscriptions established");

        Ok(BridgeRuntime {
            consumer: self.spawn_consumer(inbound),
            sweepers: self.start_sweepers(),
        })
    }

    /// Spawn the single consumer loop draining the inbound channel.
    pub fn spawn_consumer(&self, mut inbound: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                service.route(&msg);
            }
            info!("inbound channel closed, consumer loop exiting");
        })
    }

    /// Start the three timeout sweepers.
    pub fn start_sweepers(&self) -> Vec<SweeperHandle> {
        let cfg = &self.config;
        vec![
            start_command_sweeper(
                self.ledger.commands(),
                Duration::from_millis(cfg.ack_timeout_ms),
                Duration::from_millis(cfg.command_sweep_interval_ms),
            ),
            start_offline_sweeper(
                self.ledger.devices(),
                Duration::from_millis(cfg.offline_threshold_ms),
                Duration::from_millis(cfg.offline_sweep_interval_ms),
            ),
            start_ota_sweeper(
                self.ledger.ota(),
                Duration::from_millis(cfg.ota_timeout_ms),
                Duration::from_millis(cfg.ota_sweep_interval_ms),
            ),
        ]
    }

    /// Route one inbound message by topic kind.
    ///
    /// Handler failures are the handlers' problem: every one of them logs
    /// and drops, so the loop survives anything a device can publish.
    pub fn route(&self, msg: &InboundMessage) {
        match hivelink_bus::topics::parse(&msg.topic) {
            Some(ParsedTopic::Device(device_id, kind)) => match kind {
                TopicKind::CommandAck => self.ack.handle(device_id, &msg.payload),
                TopicKind::Heartbeat => self.ingest.handle_heartbeat(device_id, &msg.payload),
                TopicKind::Telemetry => self.ingest.handle_telemetry(device_id, &msg.payload),
                TopicKind::OtaProgress => self.ota_progress.handle(device_id, &msg.payload),
                TopicKind::Commands => {
                    // Downlink-only channel; a publish here is a confused
                    // or hostile device.
                    debug!(device_id, "ignoring inbound message on command topic");
                }
            },
            Some(ParsedTopic::RegisterRequest) => {
                self.provision.handle_register_request(&msg.payload);
            }
            None => {
                debug!(topic = %msg.topic, "dropping message on unroutable topic");
            }
        }
    }

    // ----- service API (the contract the HTTP layer consumes) -----

    /// Create a command and dispatch it to the device.
    pub async fn create_command(
        &self,
        device_id: DeviceId,
        kind: String,
        payload: serde_json::Value,
        source: CommandSource,
        requested_by: Option<String>,
    ) -> Result<Command, Error> {
        self.ledger
            .devices()
            .get_active(device_id)
            .map_err(Error::from)?
            .ok_or_else(|| Error::device_not_found(device_id))?;

        let command = self
            .ledger
            .commands()
            .create(NewCommand {
                device_id,
                kind,
                payload,
                source,
                requested_by,
            })
            .map_err(Error::from)?;

        self.dispatcher.dispatch(command.id).await?;

        // Re-read: dispatch advanced the row.
        self.ledger
            .commands()
            .get(command.id)
            .map_err(Error::from)?
            .ok_or_else(|| Error::command_not_found(command.id))
    }

    /// Trigger an OTA update.
    pub async fn trigger_ota(
        &self,
        device_id: DeviceId,
        release_id: ReleaseId,
        requested_by: Option<String>,
    ) -> Result<OtaTicket, Error> {
        self.ota.trigger(device_id, release_id, requested_by).await
    }

    /// Issue credentials to a device known by MAC (operator flow).
    pub async fn issue_credentials(
        &self,
        mac: &str,
        device_id: DeviceId,
        device_key: &str,
        requested_by: Option<String>,
    ) -> Result<(), Error> {
        self.provision
            .issue_credentials(mac, device_id, device_key, requested_by)
            .await
            .map(|outcome| {
                debug!(?outcome, "credentials dispatch finished");
            })
    }

    /// Read one command. No side effects.
    pub fn get_command(&self, id: CommandId) -> Result<Command, Error> {
        self.ledger
            .commands()
            .get(id)
            .map_err(Error::from)?
            .ok_or_else(|| Error::command_not_found(id))
    }

    /// Read one OTA job. No side effects.
    pub fn get_ota_job(&self, id: OtaJobId) -> Result<OtaJob, Error> {
        self.ledger
            .ota()
            .get(id)
            .map_err(Error::from)?
            .ok_or_else(|| Error::ota_job_not_found(id))
    }

    /// List a device's OTA jobs. No side effects.
    pub fn list_ota_jobs(&self, device_id: DeviceId) -> Result<Vec<OtaJob>, Error> {
        self.ledger.ota().list_for_device(device_id).map_err(Error::from)
    }

    /// The underlying ledger, for administrative seeding.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}

impl std::fmt::Debug for BridgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct OkPublisher;

    #[async_trait]
    impl MessagePublisher for OkPublisher {
        async fn publish(&self, _: &str, _: Vec<u8>, _: Qos) -> hivelink_bus::Result<()> {
            Ok(())
        }
    }

    fn service() -> BridgeService {
        BridgeService::new(
            BridgeConfig::default(),
            Ledger::ephemeral().unwrap(),
            Arc::new(OkPublisher),
        )
    }

    #[tokio::test]
    async fn test_create_command_requires_known_device() {
        let service = service();
        let err = service
            .create_command(
                1,
                "SET_POWER".into(),
                serde_json::json!({}),
                CommandSource::User,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "device", .. }));
    }

    #[tokio::test]
    async fn test_route_survives_garbage() {
        let service = service();
        for (topic, payload) in [
            ("devices/abc/telemetry", &b"{}"[..]),
            ("devices/7/commands", b"{}"),
            ("devices/7/telemetry", b"not json"),
            ("completely/else", b""),
            ("devices/register/request", b"{}"),
        ] {
            service.route(&InboundMessage {
                topic: topic.into(),
                payload: payload.to_vec(),
            });
        }
    }

    #[tokio::test]
    async fn test_read_paths_are_typed_errors() {
        let service = service();
        assert!(matches!(
            service.get_command(5),
            Err(Error::NotFound { kind: "command", .. })
        ));
        assert!(matches!(
            service.get_ota_job(5),
            Err(Error::NotFound { kind: "ota job", .. })
        ));
        assert!(service.list_ota_jobs(5).unwrap().is_empty());
    }
}

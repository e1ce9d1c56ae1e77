//! Device registration handshake.
//!
//! Unregistered devices announce themselves on the broker-wide registration
//! channel. The bridge validates the announcement and logs it for an
//! operator; provisioning stays a human decision. The companion flow is
//! operator-initiated: `issue_credentials` publishes a `SET_CREDENTIALS`
//! grant to both the registration topic (keyed by MAC) and the device's own
//! command topic, so the device receives it no matter which topic it is
//! listening on mid-transition.

use std::sync::Arc;

use tracing::{info, warn};

use hivelink_bus::{MessagePublisher, Qos, TopicKind, REGISTER_REQUEST_TOPIC};
use hivelink_core::{DeviceId, Error};
use hivelink_storage::{CommandSource, CommandStore, NewCommand};

use crate::dispatch::{CommandDispatcher, DispatchOutcome};
use crate::messages::{CredentialsGrant, RegisterRequest};

const SET_CREDENTIALS: &str = "SET_CREDENTIALS";

/// Handles registration announcements and credential grants.
#[derive(Clone)]
pub struct ProvisionHandler {
    commands: CommandStore,
    dispatcher: CommandDispatcher,
    publisher: Arc<dyn MessagePublisher>,
}

impl ProvisionHandler {
    /// Create a provisioning handler.
    pub fn new(
        commands: CommandStore,
        dispatcher: CommandDispatcher,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            commands,
            dispatcher,
            publisher,
        }
    }

    /// Handle one raw self-announcement from the registration channel.
    ///
    /// Schema-validated and logged; no automated provisioning happens here.
    pub fn handle_register_request(&self, payload: &[u8]) {
        match serde_json::from_slice::<RegisterRequest>(payload) {
            Ok(req) => {
                info!(
                    mac = %req.mac,
                    device_type = %req.device_type,
                    firmware = %req.firmware,
                    ip = %req.ip,
                    "registration request received, awaiting operator action"
                );
            }
            Err(e) => {
                warn!("dropping malformed registration request: {e}");
            }
        }
    }

    /// Operator-initiated: push credentials to a device known by MAC.
    ///
    /// Creates a `SET_CREDENTIALS` command dispatched to the device's own
    /// command topic, and additionally publishes a MAC-keyed grant on the
    /// registration topic for a device that has not switched over yet.
    pub async fn issue_credentials(
        &self,
        mac: &str,
        device_id: DeviceId,
        device_key: &str,
        requested_by: Option<String>,
    ) -> Result<DispatchOutcome, Error> {
        let grant = CredentialsGrant {
            kind: SET_CREDENTIALS.to_string(),
            mac: mac.to_string(),
            device_id,
            device_key: device_key.to_string(),
        };
        let grant_payload = serde_json::to_vec(&grant)?;
        if let Err(e) = self
            .publisher
            .publish(REGISTER_REQUEST_TOPIC, grant_payload, Qos::AtLeastOnce)
            .await
        {
            // The per-device command below still goes out; a registered
            // device no longer listens on the registration channel anyway.
            warn!(%mac, device_id, "credentials grant on registration topic failed: {e}");
        }

        let command = self
            .commands
            .create(NewCommand {
                device_id,
                kind: SET_CREDENTIALS.to_string(),
                payload: serde_json::json!({
                    "mac": mac,
                    "deviceId": device_id,
                    "deviceKey": device_key,
                }),
                source: CommandSource::Admin,
                requested_by,
            })
            .map_err(Error::from)?;

        let outcome = self.dispatcher.dispatch(command.id).await?;
        info!(%mac, device_id, command_id = command.id, ?outcome, "credentials issued");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use hivelink_core::RetryPolicy;
    use hivelink_storage::{CommandStatus, Ledger};

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl MessagePublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>, _: Qos) -> hivelink_bus::Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn setup() -> (Ledger, Arc<RecordingPublisher>, ProvisionHandler) {
        let ledger = Ledger::ephemeral().unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = CommandDispatcher::new(
            ledger.commands(),
            publisher.clone(),
            RetryPolicy::none(),
        );
        let handler = ProvisionHandler::new(ledger.commands(), dispatcher, publisher.clone());
        (ledger, publisher, handler)
    }

    #[test]
    fn test_register_request_validation_never_panics() {
        let (_, _, handler) = setup();
        handler.handle_register_request(
            br#"{"mac": "aa:bb:cc:dd:ee:ff", "type": "smart_plug", "firmware": "1.2.0", "ip": "10.0.0.9"}"#,
        );
        handler.handle_register_request(b"not json");
        handler.handle_register_request(br#"{"mac": "aa:bb"}"#);
    }

    #[tokio::test]
    async fn test_issue_credentials_publishes_to_both_topics() {
        let (ledger, publisher, handler) = setup();

        let outcome = handler
            .issue_credentials("aa:bb:cc:dd:ee:ff", 7, "new-key", Some("op".into()))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Sent);

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, REGISTER_REQUEST_TOPIC);
        assert_eq!(published[1].0, "devices/7/commands");

        let grant: CredentialsGrant = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(grant.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(grant.device_key, "new-key");

        // The per-device path went through the command ledger.
        let commands = ledger.commands().list_for_device(7).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].kind, "SET_CREDENTIALS");
        assert_eq!(commands[0].status, CommandStatus::Sent);
    }
}

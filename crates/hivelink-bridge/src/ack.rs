//! Acknowledgment reconciliation.
//!
//! Subscribed on the wildcard ack topic, so every device funnels into this
//! handler. Everything arriving here is untrusted: parse failures, unknown
//! commands and device mismatches are silent drops with a log line, and the
//! actual state change is a conditional update that tolerates duplicates
//! and late arrivals.

use tracing::{debug, info, warn};

use hivelink_core::DeviceId;
use hivelink_storage::{AckOutcome, CommandStore};

use crate::messages::{AckMessage, AckStatus};

/// Applies device acknowledgments to the command ledger.
#[derive(Clone)]
pub struct AckHandler {
    commands: CommandStore,
}

impl AckHandler {
    /// Create an ack handler.
    pub fn new(commands: CommandStore) -> Self {
        Self { commands }
    }

    /// Handle one raw ack payload from `device_id`'s ack topic.
    ///
    /// Never returns an error to the router: a store failure is logged and
    /// the next message is still processed.
    pub fn handle(&self, device_id: DeviceId, payload: &[u8]) {
        let ack: AckMessage = match serde_json::from_slice(payload) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(device_id, "dropping malformed ack: {e}");
                return;
            }
        };

        let command = match self.commands.get(ack.command_id) {
            Ok(Some(command)) => command,
            Ok(None) => {
                warn!(device_id, command_id = ack.command_id, "dropping ack for unknown command");
                return;
            }
            Err(e) => {
                warn!(device_id, command_id = ack.command_id, "ack lookup failed: {e}");
                return;
            }
        };

        // A device may only ack its own commands.
        if command.device_id != device_id {
            warn!(
                device_id,
                command_id = ack.command_id,
                owner = command.device_id,
                "dropping ack from wrong device"
            );
            return;
        }

        let outcome = match ack.status {
            AckStatus::Acked => AckOutcome::Acked,
            AckStatus::Failed => AckOutcome::Failed,
        };

        match self.commands.apply_ack(ack.command_id, outcome, ack.error) {
            Ok(true) => {
                debug!(device_id, command_id = ack.command_id, status = ?ack.status, "ack applied");
            }
            Ok(false) => {
                // Already terminal: the first outcome stands.
                info!(device_id, command_id = ack.command_id, "ack ignored: command already settled");
            }
            Err(e) => {
                warn!(device_id, command_id = ack.command_id, "ack update failed: {e}");
            }
        }
    }
}

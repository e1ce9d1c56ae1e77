//! Command dispatch: publish with bounded retry, then a conditional ledger
//! transition.
//!
//! Dispatch never throws for transport failures: the retry ladder runs to
//! success or exhaustion, and the outcome lands in the ledger as `Sent` or
//! `Failed`. The transitions are guarded on `Pending` so a concurrent ack or
//! sweep that already advanced the command turns this writer into a no-op.

use std::sync::Arc;

use tracing::{debug, info, warn};

use hivelink_bus::{MessagePublisher, Qos, TopicKind};
use hivelink_core::{CommandId, Error, RetryPolicy};
use hivelink_storage::{commands::DISPATCH_EXHAUSTED, CommandStatus, CommandStore};

use crate::messages::CommandEnvelope;

/// Result of one dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Published and transitioned to `Sent`.
    Sent,
    /// The command was not `Pending`; nothing published, nothing mutated.
    NotPending,
    /// Publish failed (retries exhausted or non-transport error); the
    /// command transitioned to `Failed`.
    Failed {
        /// Diagnostic recorded on the command.
        error: String,
    },
}

/// Publishes commands to device topics.
#[derive(Clone)]
pub struct CommandDispatcher {
    commands: CommandStore,
    publisher: Arc<dyn MessagePublisher>,
    retry: RetryPolicy,
}

impl CommandDispatcher {
    /// Create a dispatcher.
    pub fn new(
        commands: CommandStore,
        publisher: Arc<dyn MessagePublisher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            commands,
            publisher,
            retry,
        }
    }

    /// Dispatch a command to its device.
    ///
    /// Blocks on the backoff ladder in the worst case, but never blocks
    /// message ingestion from other devices; callers run it from their own
    /// task. Not cancellable: a started dispatch runs to success or
    /// exhaustion.
    pub async fn dispatch(&self, command_id: CommandId) -> Result<DispatchOutcome, Error> {
        let command = self
            .commands
            .get(command_id)
            .map_err(Error::from)?
            .ok_or_else(|| Error::command_not_found(command_id))?;

        if command.status != CommandStatus::Pending {
            info!(
                command_id,
                status = command.status.as_str(),
                "dispatch skipped: command not pending"
            );
            return Ok(DispatchOutcome::NotPending);
        }

        let envelope = CommandEnvelope {
            command_id: command.id,
            kind: command.kind.clone(),
            payload: command.payload.clone(),
        };
        let payload = serde_json::to_vec(&envelope)?;
        let topic = TopicKind::Commands.topic(command.device_id);

        let mut retry = 0u32;
        let error = loop {
            match self
                .publisher
                .publish(&topic, payload.clone(), Qos::AtLeastOnce)
                .await
            {
                Ok(()) => {
                    if !self.commands.mark_sent(command_id).map_err(Error::from)? {
                        // An ack or sweep advanced it between publish and
                        // commit; their outcome stands.
                        info!(command_id, "publish landed but command already advanced");
                    }
                    debug!(command_id, %topic, "command published");
                    return Ok(DispatchOutcome::Sent);
                }
                Err(e) if e.is_transport() && retry < self.retry.max_retries => {
                    let delay = self
                        .retry
                        .delay_for_retry(retry)
                        .unwrap_or_default();
                    warn!(
                        command_id,
                        retry = retry + 1,
                        max = self.retry.max_retries,
                        "publish failed ({e}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) if e.is_transport() => break DISPATCH_EXHAUSTED.to_string(),
                Err(e) => break e.to_string(),
            }
        };

        warn!(command_id, %error, "dispatch failed");
        if !self
            .commands
            .mark_dispatch_failed(command_id, &error)
            .map_err(Error::from)?
        {
            info!(command_id, "dispatch failure ignored: command already advanced");
        }
        Ok(DispatchOutcome::Failed { error })
    }
}

//! Command ledger.
//!
//! A Command is a single directive sent to one device. Rows are created in
//! `Pending`, advanced by the dispatcher and the ack handler, forced to
//! `Timeout` by the sweep worker, and never physically deleted; terminal
//! rows are retained for audit.
//!
//! Every mutation here is a conditional update: the guard is evaluated
//! against the current row inside the write transaction, and a guard miss
//! returns `false` instead of an error. Callers treat `false` as "another
//! writer got there first" and log it as ignored.

use chrono::{DateTime, Duration, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hivelink_core::{CommandId, DeviceId};

use crate::codec::{self, META_TABLE};
use crate::error::Result;
use crate::Ledger;

// Commands table: key = command id, value = Command (JSON)
pub(crate) const COMMANDS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("commands");

const ID_KEY: &str = "commands";

/// Diagnostic code recorded when the publish retry budget is exhausted.
pub const DISPATCH_EXHAUSTED: &str = "PUBLISH_RETRIES_EXHAUSTED";

/// Command lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Created, not yet published.
    Pending,
    /// Published to the device, waiting for an ack.
    Sent,
    /// Device confirmed execution.
    Acked,
    /// Dispatch exhausted its retries, or the device reported failure.
    Failed,
    /// The sweep worker gave up waiting for an ack.
    Timeout,
}

impl CommandStatus {
    /// Whether this status permits no further transitions.
    ///
    /// `Timeout` is terminal for the sweep but still accepts a late ack;
    /// see [`CommandStore::apply_ack`].
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Acked | CommandStatus::Failed | CommandStatus::Timeout
        )
    }

    /// Status as the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Sent => "SENT",
            CommandStatus::Acked => "ACKED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Timeout => "TIMEOUT",
        }
    }
}

/// Where a command originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandSource {
    /// A user action.
    User,
    /// Backend-internal logic.
    #[default]
    Backend,
    /// An AI decision.
    Ai,
    /// An operator/administrative action.
    Admin,
}

impl CommandSource {
    /// Source as the wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandSource::User => "USER",
            CommandSource::Backend => "BACKEND",
            CommandSource::Ai => "AI",
            CommandSource::Admin => "ADMIN",
        }
    }
}

/// Outcome reported by a device acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The device applied the command.
    Acked,
    /// The device rejected or failed the command.
    Failed,
}

/// A single directive sent to one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Ledger-allocated id.
    pub id: CommandId,
    /// Target device.
    pub device_id: DeviceId,
    /// Free-form directive name, e.g. `OTA_UPDATE` or `SET_CREDENTIALS`.
    pub kind: String,
    /// Opaque structured payload forwarded to the device.
    pub payload: serde_json::Value,
    /// Current lifecycle status.
    pub status: CommandStatus,
    /// Globally unique id assigned at creation, immutable thereafter.
    pub correlation_id: Uuid,
    /// Originating user, when known.
    pub requested_by: Option<String>,
    /// Origin of the command.
    pub source: CommandSource,
    /// When the device's acknowledgment was applied.
    pub acked_at: Option<DateTime<Utc>>,
    /// Last diagnostic recorded for this command.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a command.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub device_id: DeviceId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub source: CommandSource,
    pub requested_by: Option<String>,
}

pub(crate) fn build_command(id: CommandId, new: NewCommand) -> Command {
    let now = Utc::now();
    Command {
        id,
        device_id: new.device_id,
        kind: new.kind,
        payload: new.payload,
        status: CommandStatus::Pending,
        correlation_id: Uuid::new_v4(),
        requested_by: new.requested_by,
        source: new.source,
        acked_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

/// Command ledger store.
#[derive(Clone)]
pub struct CommandStore {
    ledger: Ledger,
}

impl CommandStore {
    pub(crate) fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Create a new command in `Pending` state.
    pub fn create(&self, new: NewCommand) -> Result<Command> {
        let txn = self.ledger.db().begin_write()?;
        let command = {
            let mut meta = txn.open_table(META_TABLE)?;
            let id = codec::next_id(&mut meta, ID_KEY)?;
            drop(meta);

            let command = build_command(id, new);
            let mut table = txn.open_table(COMMANDS_TABLE)?;
            table.insert(id, codec::encode(&command)?.as_str())?;
            command
        };
        txn.commit()?;
        Ok(command)
    }

    /// Load a command by id.
    pub fn get(&self, id: CommandId) -> Result<Option<Command>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(COMMANDS_TABLE)?;
        let raw = table.get(id)?.map(|g| g.value().to_string());
        raw.map(|r| codec::decode(&r)).transpose()
    }

    /// List all commands for one device, oldest first.
    pub fn list_for_device(&self, device_id: DeviceId) -> Result<Vec<Command>> {
        let txn = self.ledger.db().begin_read()?;
        let table = txn.open_table(COMMANDS_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let command: Command = codec::decode(value.value())?;
            if command.device_id == device_id {
                out.push(command);
            }
        }
        Ok(out)
    }

    /// `Pending → Sent` after a successful publish.
    ///
    /// Returns `false` if the command was no longer `Pending` (a concurrent
    /// ack or sweep already advanced it).
    pub fn mark_sent(&self, id: CommandId) -> Result<bool> {
        self.conditional_update(id, |command| {
            if command.status != CommandStatus::Pending {
                return false;
            }
            command.status = CommandStatus::Sent;
            true
        })
    }

    /// `Pending → Failed` after the publish retry budget is exhausted.
    pub fn mark_dispatch_failed(&self, id: CommandId, error: &str) -> Result<bool> {
        self.conditional_update(id, |command| {
            if command.status != CommandStatus::Pending {
                return false;
            }
            command.status = CommandStatus::Failed;
            command.last_error = Some(error.to_string());
            true
        })
    }

    /// Apply a device acknowledgment.
    ///
    /// Guard: status must be `Sent` or `Timeout`. The `Timeout` case lets a
    /// late ack rescue a command the sweep already gave up on; an ack for an
    /// already-`Acked`/`Failed` command matches zero rows and is a no-op.
    pub fn apply_ack(
        &self,
        id: CommandId,
        outcome: AckOutcome,
        error: Option<String>,
    ) -> Result<bool> {
        self.conditional_update(id, |command| {
            if !matches!(command.status, CommandStatus::Sent | CommandStatus::Timeout) {
                return false;
            }
            command.status = match outcome {
                AckOutcome::Acked => CommandStatus::Acked,
                AckOutcome::Failed => CommandStatus::Failed,
            };
            command.acked_at = Some(Utc::now());
            if let Some(e) = error {
                command.last_error = Some(e);
            }
            true
        })
    }

    /// Force `Timeout` on every command still `Sent`, unacknowledged, and
    /// created before `now - ack_timeout`. Returns the ids transitioned.
    ///
    /// Set-based and idempotent: a second sweep over the same rows matches
    /// nothing, and an ack racing this sweep still lands afterwards because
    /// [`apply_ack`](Self::apply_ack) accepts `Timeout` rows.
    pub fn sweep_timeouts(&self, ack_timeout: Duration) -> Result<Vec<CommandId>> {
        let cutoff = Utc::now() - ack_timeout;
        let txn = self.ledger.db().begin_write()?;
        let swept = {
            let mut table = txn.open_table(COMMANDS_TABLE)?;
            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let command: Command = codec::decode(value.value())?;
                if command.status == CommandStatus::Sent
                    && command.acked_at.is_none()
                    && command.created_at < cutoff
                {
                    expired.push(command);
                }
            }

            let mut swept = Vec::with_capacity(expired.len());
            for mut command in expired {
                command.status = CommandStatus::Timeout;
                command.updated_at = Utc::now();
                table.insert(command.id, codec::encode(&command)?.as_str())?;
                swept.push(command.id);
            }
            swept
        };
        txn.commit()?;
        Ok(swept)
    }

    /// `{Pending, Sent} → Timeout`, used when an OTA job times out and its
    /// linked command should not keep waiting.
    pub fn cascade_timeout(&self, id: CommandId) -> Result<bool> {
        self.conditional_update(id, |command| {
            if !matches!(command.status, CommandStatus::Pending | CommandStatus::Sent) {
                return false;
            }
            command.status = CommandStatus::Timeout;
            true
        })
    }

    /// Read-check-write inside one transaction. `mutate` returns whether the
    /// guard matched; on `false` nothing is written.
    fn conditional_update<F>(&self, id: CommandId, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut Command) -> bool,
    {
        let txn = self.ledger.db().begin_write()?;
        let updated = {
            let mut table = txn.open_table(COMMANDS_TABLE)?;
            let raw = table.get(id)?.map(|g| g.value().to_string());
            match raw {
                None => false,
                Some(raw) => {
                    let mut command: Command = codec::decode(&raw)?;
                    if mutate(&mut command) {
                        command.updated_at = Utc::now();
                        table.insert(id, codec::encode(&command)?.as_str())?;
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

    fn store() -> CommandStore {
        Ledger::ephemeral().unwrap().commands()
    }

    fn new_command(device_id: DeviceId) -> NewCommand {
        NewCommand {
            device_id,
            kind: "SET_POWER".into(),
            payload: serde_json::json!({"on": true}),
            source: CommandSource::User,
            requested_by: Some("user-9".into()),
        }
    }

    #[test]
    fn test_create_assigns_ids_and_correlation() {
        let store = store();
        let a = store.create(new_command(7)).unwrap();
        let b = store.create(new_command(7)).unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.status, CommandStatus::Pending);
        assert_ne!(a.correlation_id, b.correlation_id);
        assert!(a.acked_at.is_none());
    }

    #[test]
    fn test_mark_sent_only_from_pending() {
        let store = store();
        let cmd = store.create(new_command(7)).unwrap();

        assert!(store.mark_sent(cmd.id).unwrap());
        assert!(!store.mark_sent(cmd.id).unwrap());
        assert_eq!(
            store.get(cmd.id).unwrap().unwrap().status,
            CommandStatus::Sent
        );
    }

    #[test]
    fn test_ack_is_idempotent() {
        let store = store();
        let cmd = store.create(new_command(7)).unwrap();
        store.mark_sent(cmd.id).unwrap();

        assert!(store.apply_ack(cmd.id, AckOutcome::Acked, None).unwrap());
        let first = store.get(cmd.id).unwrap().unwrap();
        assert_eq!(first.status, CommandStatus::Acked);
        let acked_at = first.acked_at.unwrap();

        // Second ack of any value matches zero rows and changes nothing.
        assert!(!store
            .apply_ack(cmd.id, AckOutcome::Failed, Some("dup".into()))
            .unwrap());
        let second = store.get(cmd.id).unwrap().unwrap();
        assert_eq!(second.status, CommandStatus::Acked);
        assert_eq!(second.acked_at.unwrap(), acked_at);
        assert!(second.last_error.is_none());
    }

    #[test]
    fn test_late_ack_rescues_timeout() {
        let store = store();
        let cmd = store.create(new_command(7)).unwrap();
        store.mark_sent(cmd.id).unwrap();

        // Sweep everything Sent, regardless of age.
        let swept = store.sweep_timeouts(Duration::zero()).unwrap();
        assert_eq!(swept, vec![cmd.id]);
        assert_eq!(
            store.get(cmd.id).unwrap().unwrap().status,
            CommandStatus::Timeout
        );

        // A late ack still lands.
        assert!(store.apply_ack(cmd.id, AckOutcome::Acked, None).unwrap());
        assert_eq!(
            store.get(cmd.id).unwrap().unwrap().status,
            CommandStatus::Acked
        );
    }

    #[test]
    fn test_sweep_skips_fresh_and_terminal() {
        let store = store();
        let fresh = store.create(new_command(7)).unwrap();
        store.mark_sent(fresh.id).unwrap();

        let acked = store.create(new_command(7)).unwrap();
        store.mark_sent(acked.id).unwrap();
        store.apply_ack(acked.id, AckOutcome::Acked, None).unwrap();

        let pending = store.create(new_command(7)).unwrap();

        let swept = store.sweep_timeouts(Duration::seconds(5)).unwrap();
        assert!(swept.is_empty());

        assert_eq!(
            store.get(fresh.id).unwrap().unwrap().status,
            CommandStatus::Sent
        );
        assert_eq!(
            store.get(pending.id).unwrap().unwrap().status,
            CommandStatus::Pending
        );
    }

    #[test]
    fn test_dispatch_failed_guard() {
        let store = store();
        let cmd = store.create(new_command(7)).unwrap();
        store.mark_sent(cmd.id).unwrap();

        // Already Sent: exhaustion report is a no-op.
        assert!(!store
            .mark_dispatch_failed(cmd.id, DISPATCH_EXHAUSTED)
            .unwrap());

        let other = store.create(new_command(7)).unwrap();
        assert!(store
            .mark_dispatch_failed(other.id, DISPATCH_EXHAUSTED)
            .unwrap());
        let failed = store.get(other.id).unwrap().unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some(DISPATCH_EXHAUSTED));
    }

    #[test]
    fn test_cascade_timeout_guard() {
        let store = store();
        let pending = store.create(new_command(7)).unwrap();
        assert!(store.cascade_timeout(pending.id).unwrap());

        let acked = store.create(new_command(7)).unwrap();
        store.mark_sent(acked.id).unwrap();
        store.apply_ack(acked.id, AckOutcome::Acked, None).unwrap();
        assert!(!store.cascade_timeout(acked.id).unwrap());
    }

    #[test]
    fn test_list_for_device() {
        let store = store();
        store.create(new_command(1)).unwrap();
        store.create(new_command(2)).unwrap();
        store.create(new_command(1)).unwrap();

        let for_one = store.list_for_device(1).unwrap();
        assert_eq!(for_one.len(), 2);
        assert!(for_one.iter().all(|c| c.device_id == 1));
    }
}

//! Timeout-sweep workers.
//!
//! Three independent periodic tasks enforce the deadlines no device can
//! violate: unacked commands, unseen devices, stuck OTA jobs. Every tick is
//! a set-based conditional update keyed on current state, so overlapping or
//! skipped ticks are harmless: a row is swept once, and a second pass over
//! it matches nothing. A store error fails the tick, not the loop.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use hivelink_storage::{CommandStore, DeviceStore, OtaStore};

/// Handle to a running sweeper; dropping it does not stop the task.
pub struct SweeperHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the loop to exit.
    ///
    /// Deterministic: the loop selects on the shutdown signal, so this does
    /// not wait out the remainder of a tick interval.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(sweeper = self.name, "sweeper task join failed: {e}");
        }
    }

    /// The sweeper's name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Spawn a periodic sweeper running `tick` every `every`.
///
/// `tick` returns how many rows it transitioned; errors are logged and the
/// next tick still runs.
fn spawn_sweeper<F>(name: &'static str, every: Duration, mut tick: F) -> SweeperHandle
where
    F: FnMut() -> Result<usize, hivelink_storage::Error> + Send + 'static,
{
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; skip straight to the cadence.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match tick() {
                        Ok(0) => {}
                        Ok(swept) => info!(sweeper = name, swept, "sweep transitioned rows"),
                        Err(e) => error!(sweeper = name, "sweep tick failed: {e}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!(sweeper = name, "sweeper stopping");
                    break;
                }
            }
        }
    });
    SweeperHandle {
        name,
        shutdown,
        handle,
    }
}

/// Start the command timeout sweeper: `Sent` + unacked + older than
/// `ack_timeout` → `Timeout`.
pub fn start_command_sweeper(
    commands: CommandStore,
    ack_timeout: Duration,
    every: Duration,
) -> SweeperHandle {
    let timeout = ChronoDuration::milliseconds(ack_timeout.as_millis() as i64);
    spawn_sweeper("command-timeout", every, move || {
        commands.sweep_timeouts(timeout).map(|ids| ids.len())
    })
}

/// Start the device offline sweeper: online + unseen past `threshold` →
/// offline.
pub fn start_offline_sweeper(
    devices: DeviceStore,
    threshold: Duration,
    every: Duration,
) -> SweeperHandle {
    let threshold = ChronoDuration::milliseconds(threshold.as_millis() as i64);
    spawn_sweeper("device-offline", every, move || {
        devices.sweep_offline(threshold).map(|ids| ids.len())
    })
}

/// Start the OTA timeout sweeper: jobs stuck in `Sent`/`Downloading` past
/// `ota_timeout` → `Timeout`, cascading to their linked commands.
pub fn start_ota_sweeper(
    ota: OtaStore,
    ota_timeout: Duration,
    every: Duration,
) -> SweeperHandle {
    let timeout = ChronoDuration::milliseconds(ota_timeout.as_millis() as i64);
    spawn_sweeper("ota-timeout", every, move || {
        ota.sweep_timeouts(timeout).map(|swept| swept.len())
    })
}

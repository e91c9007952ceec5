//! Suspension of destructive repository maintenance.
//!
//! For each node a marker file tells maintenance jobs to stand down, then
//! the node is polled until no maintenance process is running. Leases live
//! in a registry owned by the [`Quiescer`] rather than in the futures doing
//! the work, so an interrupted run can still find and release every marker
//! it wrote.

pub mod lease;

pub use lease::{Lease, LeaseState};

use crate::config::Config;
use crate::transport::{shell_quote, Host, RemoteShell, SshOptions};
use crate::utils::errors::{BackupError, Result, TransportError};
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

pub const MARKER_NAME: &str = ".sync_in_progress";

/// Marker location under a node's data root.
pub fn marker_path(data_root: &str) -> String {
    format!("{}/repositories/{MARKER_NAME}", data_root.trim_end_matches('/'))
}

#[derive(Debug, Clone)]
pub struct QuiesceSettings {
    pub marker: String,
    pub wrapper: String,
    pub patterns: Vec<String>,
    /// Polls before a node counts as timed out
    pub budget: u32,
    pub interval: Duration,
}

impl QuiesceSettings {
    pub fn from_config(config: &Config, data_root: &str) -> Self {
        Self {
            marker: marker_path(data_root),
            wrapper: config.remote.user_wrapper.clone(),
            patterns: config.quiesce.process_patterns.clone(),
            budget: config.quiesce.cooldown_period,
            interval: Duration::from_millis(config.quiesce.poll_interval_ms),
        }
    }
}

struct Slot {
    state: LeaseState,
    lease: Option<Lease>,
}

pub struct Quiescer<'a, S> {
    shell: &'a S,
    settings: QuiesceSettings,
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl<'a, S: RemoteShell> Quiescer<'a, S> {
    pub fn new(shell: &'a S, settings: QuiesceSettings) -> Self {
        Self {
            shell,
            settings,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn marker(&self) -> &str {
        &self.settings.marker
    }

    pub fn state(&self, node: &str) -> LeaseState {
        self.slots()
            .get(node)
            .map(|slot| slot.state)
            .unwrap_or(LeaseState::Idle)
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, node: &str, state: LeaseState) {
        if let Some(slot) = self.slots().get_mut(node) {
            slot.state = state;
        }
    }

    /// Write the maintenance-suspended marker on `host`.
    pub async fn acquire(&self, host: &Host) -> Result<()> {
        let node = host.name().to_string();
        let lease = Lease::new(host.clone(), &self.settings.marker, &self.settings.wrapper);
        let command = lease.acquire_command();

        {
            let mut slots = self.slots();
            if slots.get(&node).is_some_and(|slot| slot.lease.is_some()) {
                lease.abandon();
                return Err(BackupError::Misuse(format!(
                    "quiescence lease on {node} is already held"
                )));
            }
            // Registered before the command is sent: if the run is interrupted
            // mid-touch the marker may exist and must still be removed.
            slots.insert(
                node.clone(),
                Slot {
                    state: LeaseState::LeaseRequested,
                    lease: Some(lease),
                },
            );
        }

        let output = self
            .shell
            .run(host, &command, &SshOptions::batch())
            .await
            .map_err(|e| BackupError::transport(&node, e))?;

        if !output.success() {
            if let Some(slot) = self.slots().get_mut(&node) {
                slot.state = LeaseState::Idle;
                if let Some(lease) = slot.lease.take() {
                    lease.abandon();
                }
            }
            error!(node = %node, code = output.code, "Failed to suspend maintenance");
            return Err(BackupError::transport(
                node,
                TransportError::Failed {
                    host: host.endpoint.to_string(),
                    command,
                    code: output.code,
                    stderr: output.stderr.trim().to_string(),
                },
            ));
        }

        self.set_state(&node, LeaseState::LeaseGranted);
        info!(node = %node, marker = %self.settings.marker, "Maintenance suspended");
        Ok(())
    }

    /// Poll until no maintenance process runs on `host`. Returns the number
    /// of polls it took.
    pub async fn drain(&self, host: &Host) -> Result<u32> {
        let node = host.name();
        let budget = self.settings.budget;
        let script = maintenance_probe_script(&self.settings.patterns);
        self.set_state(node, LeaseState::Draining);

        for poll in 1..=budget {
            let output = self
                .shell
                .run_script(host, &script, &SshOptions::batch())
                .await
                .map_err(|e| BackupError::transport(node, e))?;

            match output.code {
                1 => {
                    self.set_state(node, LeaseState::Drained);
                    info!(node = %node, polls = poll, "Maintenance drained");
                    return Ok(poll);
                }
                0 => {
                    debug!(node = %node, poll, budget, "Maintenance still running");
                    if poll < budget {
                        tokio::time::sleep(self.settings.interval).await;
                    }
                }
                code => {
                    return Err(BackupError::transport(
                        node,
                        TransportError::Failed {
                            host: host.endpoint.to_string(),
                            command: "maintenance probe".into(),
                            code,
                            stderr: output.stderr.trim().to_string(),
                        },
                    ));
                }
            }
        }

        self.set_state(node, LeaseState::TimedOut);
        error!(node = %node, budget, "Maintenance did not quiesce within the cooldown period");
        Err(BackupError::QuiescenceTimeout {
            node: node.to_string(),
            budget,
        })
    }

    /// Acquire and drain every host concurrently. Returns on the first
    /// failure; leases already written stay registered for [`release_all`].
    ///
    /// [`release_all`]: Quiescer::release_all
    pub async fn suspend_all(&self, hosts: &[Host]) -> Result<()> {
        let mut pending: FuturesUnordered<_> = hosts
            .iter()
            .map(|host| async move {
                self.acquire(host).await?;
                self.drain(host).await.map(|_| ())
            })
            .collect();

        while let Some(result) = pending.next().await {
            result?;
        }
        Ok(())
    }

    /// Release every registered lease. Returns the nodes whose marker could
    /// not be removed.
    pub async fn release_all(&self) -> Vec<String> {
        let leases: Vec<Lease> = self
            .slots()
            .values_mut()
            .filter_map(|slot| slot.lease.take())
            .collect();

        let results = join_all(leases.into_iter().map(|lease| async move {
            let node = lease.node().to_string();
            (node, lease.release(self.shell).await)
        }))
        .await;

        let mut failed = Vec::new();
        for (node, result) in results {
            match result {
                Ok(()) => {
                    self.set_state(&node, LeaseState::Released);
                    info!(node = %node, "Maintenance re-enabled");
                }
                Err(e) => {
                    error!(node = %node, error = %e, "Failed to re-enable maintenance");
                    failed.push(node);
                }
            }
        }
        failed
    }
}

/// Script exiting 0 while any pattern matches a running process, 1 when none
/// does.
fn maintenance_probe_script(patterns: &[String]) -> String {
    let mut script = String::from("for pattern in");
    for pattern in patterns {
        script.push(' ');
        script.push_str(&shell_quote(pattern));
    }
    script.push_str("; do\n  if pgrep -f \"$pattern\" >/dev/null; then exit 0; fi\ndone\nexit 1\n");
    script
}

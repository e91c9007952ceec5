//! Maintenance-suspension lease for a single node.

use crate::transport::{shell_quote, Host, RemoteShell, SshOptions};
use crate::utils::errors::TransportError;
use std::fmt;

/// Per-node progress through quiescence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Idle,
    LeaseRequested,
    LeaseGranted,
    Draining,
    Drained,
    TimedOut,
    Released,
}

impl LeaseState {
    /// Whether the remote marker may exist in this state.
    pub fn holds_marker(self) -> bool {
        matches!(
            self,
            LeaseState::LeaseRequested
                | LeaseState::LeaseGranted
                | LeaseState::Draining
                | LeaseState::Drained
                | LeaseState::TimedOut
        )
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeaseState::Idle => "idle",
            LeaseState::LeaseRequested => "lease-requested",
            LeaseState::LeaseGranted => "lease-granted",
            LeaseState::Draining => "draining",
            LeaseState::Drained => "drained",
            LeaseState::TimedOut => "timed-out",
            LeaseState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Claim that maintenance is suspended on one node.
///
/// Releasing consumes the lease, so it can happen at most once. A lease
/// dropped without release is logged: it means a node may be left with
/// maintenance disabled.
#[derive(Debug)]
pub struct Lease {
    host: Host,
    marker: String,
    wrapper: String,
    released: bool,
}

impl Lease {
    pub(crate) fn new(host: Host, marker: &str, wrapper: &str) -> Self {
        Self {
            host,
            marker: marker.to_string(),
            wrapper: wrapper.to_string(),
            released: false,
        }
    }

    pub fn node(&self) -> &str {
        self.host.name()
    }

    pub(crate) fn acquire_command(&self) -> String {
        self.wrapped(&format!("touch {}", shell_quote(&self.marker)))
    }

    fn release_command(&self) -> String {
        self.wrapped(&format!("rm -f {}", shell_quote(&self.marker)))
    }

    fn wrapped(&self, command: &str) -> String {
        if self.wrapper.trim().is_empty() {
            command.to_string()
        } else {
            format!("{} {command}", self.wrapper.trim())
        }
    }

    /// Give up a lease whose marker was never written.
    pub(crate) fn abandon(mut self) {
        self.released = true;
    }

    /// Remove the remote marker.
    pub async fn release<S: RemoteShell>(mut self, shell: &S) -> Result<(), TransportError> {
        // A failed attempt still counts as the one release.
        self.released = true;
        let command = self.release_command();
        let output = shell.run(&self.host, &command, &SshOptions::batch()).await?;
        if !output.success() {
            return Err(TransportError::Failed {
                host: self.host.endpoint.to_string(),
                command,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            tracing::error!(
                node = %self.host.name(),
                marker = %self.marker,
                "Quiescence lease dropped without release; maintenance may remain suspended"
            );
        }
    }
}

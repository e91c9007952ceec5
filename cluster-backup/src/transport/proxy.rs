//! Bastion routing for nodes that are not directly reachable.
//!
//! A tunnel is a generated ssh_config file whose `ProxyCommand` hops
//! through the primary. The file lives in the temp dir for as long as any
//! clone of the [`Tunnel`] is alive and is never shared between processes.

use super::{shell_quote, Endpoint};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempPath;

#[derive(Debug, Clone)]
pub struct Tunnel {
    config: Arc<TempPath>,
}

impl Tunnel {
    /// Write a proxy config routing `endpoint` through `via`.
    pub fn create(ssh_program: &str, endpoint: &Endpoint, via: &Endpoint) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("cluster-backup-ssh-")
            .suffix(".config")
            .tempfile()?;
        file.write_all(render_proxy_config(ssh_program, endpoint, via).as_bytes())?;
        file.flush()?;

        Ok(Self {
            config: Arc::new(file.into_temp_path()),
        })
    }

    /// Path to pass to `ssh -F`.
    pub fn config_path(&self) -> &Path {
        &self.config
    }
}

fn render_proxy_config(ssh_program: &str, endpoint: &Endpoint, via: &Endpoint) -> String {
    format!(
        "Host {host}\n  ServerAliveInterval 60\n  StrictHostKeyChecking no\n  ProxyCommand {ssh} -q -o BatchMode=yes -p {port} -l {user} {bastion} nc.openbsd %h %p\n",
        host = endpoint.hostname,
        ssh = shell_quote(ssh_program),
        port = via.port,
        user = shell_quote(&via.user),
        bastion = shell_quote(&via.hostname),
    )
}

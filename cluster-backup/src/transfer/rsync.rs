//! External sync tool invocation.

use super::phase::{FilterRule, TransferPhase};
use crate::config::Config;
use crate::transport::{Host, SshOptions, SshTransport};
use crate::utils::errors::TransportError;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// rsync: some source files vanished before they could be transferred.
pub const VANISHED_SOURCE_FILES: i32 = 24;

#[derive(Debug, Clone)]
pub enum SyncSource {
    Remote { host: Host, path: String },
    Local(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Node the data belongs to
    pub node: String,
    pub phase: TransferPhase,
    pub source: SyncSource,
    pub destination: PathBuf,
    /// Previous snapshot to hard-link unchanged files from
    pub link_dest: Option<PathBuf>,
    pub rules: Vec<FilterRule>,
    pub compress: bool,
    pub hard_links: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub exit_code: i32,
    /// Regular files actually copied, from `--stats`
    pub files_transferred: Option<u64>,
    pub stderr: String,
}

pub trait SyncTool: Send + Sync {
    fn sync(
        &self,
        request: &SyncRequest,
    ) -> impl Future<Output = Result<SyncOutcome, TransportError>> + Send;
}

#[derive(Debug, Clone)]
pub struct RsyncTool {
    program: String,
    nice: bool,
    verbose: bool,
    remote_rsync: String,
    ssh: SshTransport,
}

impl RsyncTool {
    pub fn new(program: impl Into<String>, remote_rsync: impl Into<String>, ssh: SshTransport) -> Self {
        Self {
            program: program.into(),
            nice: false,
            verbose: false,
            remote_rsync: remote_rsync.into(),
            ssh,
        }
    }

    pub fn from_config(config: &Config, ssh: SshTransport) -> Self {
        Self {
            nice: config.sync.nice,
            verbose: config.transport.verbose,
            ..Self::new(
                config.sync.rsync_program.clone(),
                config.remote.rsync_path.clone(),
                ssh,
            )
        }
    }

    pub fn build_args(&self, request: &SyncRequest) -> Vec<String> {
        let mut args: Vec<String> = ["-a", "-m", "--numeric-ids", "--stats"]
            .into_iter()
            .map(str::to_string)
            .collect();

        if self.verbose {
            args.push("-v".into());
        }
        if request.hard_links {
            args.push("-H".into());
        }
        if let Some(link_dest) = &request.link_dest {
            args.push(format!("--link-dest={}", link_dest.display()));
        }
        for rule in &request.rules {
            args.push(format!("--filter={rule}"));
        }

        match &request.source {
            SyncSource::Remote { host, path } => {
                if request.compress {
                    args.push("-z".into());
                }
                args.push("-e".into());
                args.push(self.ssh.remote_shell_line(host, &SshOptions::batch()));
                args.push(format!("--rsync-path={}", self.remote_rsync));
                args.push(format!(
                    "{}:{}/",
                    host.endpoint.remote_host(),
                    path.trim_end_matches('/')
                ));
            }
            SyncSource::Local(path) => {
                args.push(format!("{}/", path.display().to_string().trim_end_matches('/')));
            }
        }

        args.push(request.destination.display().to_string());
        args
    }

    fn command(&self, request: &SyncRequest) -> Command {
        let mut cmd = if self.nice {
            let mut cmd = Command::new("nice");
            cmd.args(["-n", "19", "ionice", "-c", "3", self.program.as_str()]);
            cmd
        } else {
            Command::new(&self.program)
        };
        cmd.args(self.build_args(request));
        cmd
    }
}

impl SyncTool for RsyncTool {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncOutcome, TransportError> {
        let mut cmd = self.command(request);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            node = %request.node,
            phase = %request.phase,
            destination = %request.destination.display(),
            "Running rsync"
        );

        let output = cmd.output().await.map_err(|source| TransportError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(SyncOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            files_transferred: parse_files_transferred(&stdout),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Read the transferred-file count from `rsync --stats` output.
pub fn parse_files_transferred(stats: &str) -> Option<u64> {
    stats.lines().find_map(|line| {
        let rest = line
            .trim()
            .strip_prefix("Number of regular files transferred:")
            .or_else(|| line.trim().strip_prefix("Number of files transferred:"))?;
        rest.trim().replace(',', "").parse().ok()
    })
}

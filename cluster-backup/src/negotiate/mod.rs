//! Host capability negotiation.
//!
//! Decides whether an endpoint is a reachable instance, which dialect it
//! speaks and which release it runs. Connection refusals on the configured
//! port are retried once on the alternate admin port; nothing else is
//! retried.

pub mod dialect;

pub use dialect::{Dialect, Version};

use crate::config::NegotiateConfig;
use crate::transport::{Endpoint, Host, RemoteShell, SshOptions};
use crate::utils::errors::{BackupError, ProtocolError, Result, TransportError};
use std::time::Duration;
use tracing::{debug, info, warn};

const NEGOTIATE_COMMAND: &str = "ghe-negotiate-version backup-utils";
pub const LEGACY_METADATA_PATH: &str = "/data/enterprise/chef_metadata.json";

const COMMAND_NOT_FOUND: i32 = 127;
const NOT_AN_INSTANCE: i32 = 101;

/// stderr fragments meaning "nothing is listening on this port".
const REFUSAL_SIGNATURES: &[&str] = &[
    "connection refused",
    "no route to host",
    "connection timed out during banner exchange",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationResult {
    /// The endpoint that answered, after any port fallback
    pub endpoint: Endpoint,
    pub dialect: Dialect,
    pub version: Version,
}

impl NegotiationResult {
    /// The line other tooling greps for after a successful check.
    pub fn confirmation_line(&self) -> String {
        format!(
            "Connect {}:{} OK (v{})",
            self.endpoint.hostname, self.endpoint.port, self.version
        )
    }
}

enum Attempt {
    Done(NegotiationResult),
    RetryAlternatePort(BackupError),
    Failed(BackupError),
}

pub struct HostNegotiator<'a, S> {
    shell: &'a S,
    alternate_port: u16,
    min_version: Option<Version>,
    connect_timeout: Duration,
}

impl<'a, S: RemoteShell> HostNegotiator<'a, S> {
    pub fn new(shell: &'a S, alternate_port: u16, connect_timeout: Duration) -> Self {
        Self {
            shell,
            alternate_port,
            min_version: None,
            connect_timeout,
        }
    }

    pub fn from_config(shell: &'a S, config: &NegotiateConfig, connect_timeout: Duration) -> Result<Self> {
        let min_version = config
            .min_version
            .as_deref()
            .map(|raw| {
                raw.parse::<Version>().map_err(|_| {
                    BackupError::Config(format!("negotiate.min_version {raw:?} is not a version"))
                })
            })
            .transpose()?;

        Ok(Self {
            min_version,
            ..Self::new(shell, config.alternate_port, connect_timeout)
        })
    }

    pub async fn negotiate(&self, endpoint: &Endpoint) -> Result<NegotiationResult> {
        let result = match self.attempt(endpoint).await {
            Attempt::Done(result) => result,
            Attempt::Failed(err) => return Err(err),
            Attempt::RetryAlternatePort(err) if endpoint.port == self.alternate_port => {
                return Err(err);
            }
            Attempt::RetryAlternatePort(err) => {
                warn!(
                    host = %endpoint,
                    alternate_port = self.alternate_port,
                    error = %err,
                    "Retrying negotiation on alternate port"
                );
                match self.attempt(&endpoint.with_port(self.alternate_port)).await {
                    Attempt::Done(result) => result,
                    Attempt::Failed(err) | Attempt::RetryAlternatePort(err) => return Err(err),
                }
            }
        };

        info!(
            host = %result.endpoint,
            dialect = %result.dialect,
            version = %result.version,
            "Negotiated host"
        );
        Ok(result)
    }

    async fn attempt(&self, endpoint: &Endpoint) -> Attempt {
        let host = Host::direct(endpoint.clone());
        let opts = SshOptions::probe(self.connect_timeout);
        let command = format!("{NEGOTIATE_COMMAND} {}", env!("CARGO_PKG_VERSION"));

        let (output, dialect) = match self.shell.run(&host, &command, &opts).await {
            Ok(output) if output.code == COMMAND_NOT_FOUND => {
                debug!(host = %endpoint, "Negotiation command missing, reading legacy metadata");
                let script = format!("cat {LEGACY_METADATA_PATH} 2>/dev/null || exit {NOT_AN_INSTANCE}\n");
                match self.shell.run_script(&host, &script, &opts).await {
                    Ok(output) => (output, Dialect::Legacy),
                    Err(err) => return self.classify_transport(endpoint, err),
                }
            }
            Ok(output) => (output, Dialect::Current),
            Err(err) => return self.classify_transport(endpoint, err),
        };

        match output.code {
            0 => self.parse_success(endpoint, dialect, &output.stdout),
            NOT_AN_INSTANCE => Attempt::Failed(
                ProtocolError::NotRecognized {
                    host: endpoint.to_string(),
                    detail: "fingerprint unreadable".into(),
                }
                .into(),
            ),
            1 if self.suggests_alternate_port(&output.stderr) => {
                Attempt::RetryAlternatePort(connectivity(endpoint, first_line(&output.stderr)))
            }
            code => Attempt::Failed(
                ProtocolError::Incompatible {
                    host: endpoint.to_string(),
                    message: non_empty_line(&output.stderr)
                        .or_else(|| non_empty_line(&output.stdout))
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("exit code {code}")),
                }
                .into(),
            ),
        }
    }

    fn parse_success(&self, endpoint: &Endpoint, dialect: Dialect, body: &str) -> Attempt {
        let Some(raw) = dialect.extract_version(body) else {
            return Attempt::Failed(
                ProtocolError::NotRecognized {
                    host: endpoint.to_string(),
                    detail: "no version in negotiation response".into(),
                }
                .into(),
            );
        };

        let version = match raw.parse::<Version>() {
            Ok(version) => version,
            Err(_) => {
                return Attempt::Failed(
                    ProtocolError::UnparsableVersion {
                        host: endpoint.to_string(),
                        raw,
                    }
                    .into(),
                );
            }
        };

        // Legacy releases use their own numbering; the minimum applies to
        // the current dialect only.
        if let (Dialect::Current, Some(minimum)) = (dialect, self.min_version) {
            if version < minimum {
                return Attempt::Failed(
                    ProtocolError::Unsupported {
                        host: endpoint.to_string(),
                        version: version.to_string(),
                        minimum: minimum.to_string(),
                    }
                    .into(),
                );
            }
        }

        Attempt::Done(NegotiationResult {
            endpoint: endpoint.clone(),
            dialect,
            version,
        })
    }

    fn classify_transport(&self, endpoint: &Endpoint, err: TransportError) -> Attempt {
        match err {
            TransportError::Connection { stderr, .. } => {
                let lowered = stderr.to_lowercase();
                let detail = first_line(&stderr);
                if REFUSAL_SIGNATURES.iter().any(|sig| lowered.contains(sig)) {
                    Attempt::RetryAlternatePort(connectivity(endpoint, detail))
                } else {
                    Attempt::Failed(connectivity(endpoint, detail))
                }
            }
            other => Attempt::Failed(BackupError::transport(endpoint.hostname.clone(), other)),
        }
    }

    fn suggests_alternate_port(&self, stderr: &str) -> bool {
        stderr
            .to_lowercase()
            .contains(&format!("port {}", self.alternate_port))
    }
}

fn connectivity(endpoint: &Endpoint, detail: String) -> BackupError {
    BackupError::Connectivity {
        host: endpoint.hostname.clone(),
        port: endpoint.port,
        user: endpoint.user.clone(),
        detail,
    }
}

fn non_empty_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

fn first_line(text: &str) -> String {
    non_empty_line(text).unwrap_or("no diagnostic output").to_string()
}

//! Remote command execution over ssh.
//!
//! Commands target a [`Host`]: an [`Endpoint`] plus an optional [`Tunnel`]
//! when the node is only reachable through a bastion. Everything the
//! orchestrator does remotely goes through the [`RemoteShell`] trait so the
//! control flow can be exercised without a network.

pub mod proxy;
pub mod ssh;

pub use proxy::Tunnel;
pub use ssh::SshTransport;

use crate::utils::errors::{BackupError, Result, TransportError};
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_USER: &str = "admin";

/// A resolved `user@host:port` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Token the endpoint was resolved from
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
}

impl Endpoint {
    /// Split a `[user@]host[:port]` token.
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        let (user, rest) = match token.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (user, rest),
            Some(_) => {
                return Err(BackupError::Config(format!("empty user in host {token:?}")));
            }
            None => (DEFAULT_USER, token),
        };

        let parse_port = |port: &str| {
            port.parse::<u16>().map_err(|_| {
                BackupError::Config(format!("invalid port {port:?} in host {token:?}"))
            })
        };
        let (hostname, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            // `[v6]` or `[v6]:port`
            let (hostname, after) = bracketed.split_once(']').ok_or_else(|| {
                BackupError::Config(format!("unclosed '[' in host {token:?}"))
            })?;
            let port = match after {
                "" => DEFAULT_PORT,
                _ => match after.strip_prefix(':') {
                    Some(port) => parse_port(port)?,
                    None => {
                        return Err(BackupError::Config(format!(
                            "unexpected {after:?} after ']' in host {token:?}"
                        )));
                    }
                },
            };
            (hostname, port)
        } else if rest.matches(':').count() > 1 {
            // Bare IPv6 literal; a port needs the bracketed form.
            (rest, DEFAULT_PORT)
        } else {
            match rest.rsplit_once(':') {
                Some((hostname, port)) => (hostname, parse_port(port)?),
                None => (rest, DEFAULT_PORT),
            }
        };

        if hostname.is_empty() {
            return Err(BackupError::Config(format!("empty hostname in {token:?}")));
        }

        Ok(Self {
            alias: token.to_string(),
            hostname: hostname.to_string(),
            port,
            user: user.to_string(),
        })
    }

    /// Hostname as it appears before a `:` separator, bracketed when it is
    /// an IPv6 literal.
    pub fn remote_host(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        }
    }

    /// The same host on a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote_host(), self.port)
    }
}

/// Where a command runs.
#[derive(Debug, Clone)]
pub struct Host {
    pub endpoint: Endpoint,
    pub tunnel: Option<Tunnel>,
}

impl Host {
    pub fn direct(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            tunnel: None,
        }
    }

    pub fn via(endpoint: Endpoint, tunnel: Tunnel) -> Self {
        Self {
            endpoint,
            tunnel: Some(tunnel),
        }
    }

    pub fn name(&self) -> &str {
        &self.endpoint.hostname
    }
}

/// Connection options for a single invocation.
#[derive(Debug, Clone, Default)]
pub struct SshOptions {
    /// Never prompt for passwords or passphrases
    pub batch_mode: bool,
    pub connect_timeout: Option<Duration>,
    pub connection_attempts: Option<u32>,
}

impl SshOptions {
    /// Non-interactive options for routine commands.
    pub fn batch() -> Self {
        Self {
            batch_mode: true,
            ..Self::default()
        }
    }

    /// Options for reachability probes: one short attempt, no prompts.
    pub fn probe(connect_timeout: Duration) -> Self {
        Self {
            batch_mode: true,
            connect_timeout: Some(connect_timeout),
            connection_attempts: Some(1),
        }
    }
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Remote command channel.
///
/// `run` and `run_script` return `Err(TransportError::Connection)` for
/// connection-layer failures (exit 255) and `Ok` with the exit code for
/// everything the remote command itself returned.
pub trait RemoteShell: Send + Sync {
    /// Run a single command. Text containing `|`, `;` or newlines is
    /// rejected without contacting the host.
    fn run(
        &self,
        host: &Host,
        command: &str,
        opts: &SshOptions,
    ) -> impl Future<Output = std::result::Result<CommandOutput, TransportError>> + Send;

    /// Run a pre-composed script body with `bash -s`.
    fn run_script(
        &self,
        host: &Host,
        script: &str,
        opts: &SshOptions,
    ) -> impl Future<Output = std::result::Result<CommandOutput, TransportError>> + Send;

    /// Route to `endpoint` through `via`.
    fn forward(
        &self,
        endpoint: &Endpoint,
        via: &Endpoint,
    ) -> std::result::Result<Tunnel, TransportError>;
}

/// Misuse guard for the simple command form.
pub fn check_simple_command(command: &str) -> std::result::Result<(), TransportError> {
    if command.contains(['|', ';', '\n']) {
        return Err(TransportError::Misuse {
            command: command.to_string(),
        });
    }
    Ok(())
}

/// Quote `value` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@,+%".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

//! `ssh` client wrapper.

use super::{check_simple_command, shell_quote, CommandOutput, Endpoint, Host, RemoteShell, SshOptions, Tunnel};
use crate::config::TransportConfig;
use crate::utils::errors::{TransportError, CONNECTION_FAILURE_CODE};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};

#[derive(Debug, Clone)]
pub struct SshTransport {
    program: String,
    extra_opts: Vec<String>,
    verbose: bool,
}

impl SshTransport {
    pub fn new(program: impl Into<String>, extra_opts: Vec<String>, verbose: bool) -> Self {
        Self {
            program: program.into(),
            extra_opts,
            verbose,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            config.ssh_program.clone(),
            config.extra_ssh_opts.clone(),
            config.verbose,
        )
    }

    /// Options placed before the hostname.
    fn connection_args(&self, host: &Host, opts: &SshOptions) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(tunnel) = &host.tunnel {
            args.push("-F".to_string());
            args.push(tunnel.config_path().display().to_string());
        }
        args.push("-p".to_string());
        args.push(host.endpoint.port.to_string());
        args.push("-l".to_string());
        args.push(host.endpoint.user.clone());
        if opts.batch_mode {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        if let Some(timeout) = opts.connect_timeout {
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        if let Some(attempts) = opts.connection_attempts {
            args.push("-o".to_string());
            args.push(format!("ConnectionAttempts={attempts}"));
        }
        if self.verbose {
            args.push("-v".to_string());
        }
        args.extend(self.extra_opts.iter().cloned());
        args
    }

    /// The same connection settings as a remote-shell line for `rsync -e`.
    pub fn remote_shell_line(&self, host: &Host, opts: &SshOptions) -> String {
        std::iter::once(self.program.clone())
            .chain(self.connection_args(host, opts))
            .map(|arg| shell_quote(&arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn exec(
        &self,
        host: &Host,
        opts: &SshOptions,
        remote: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, TransportError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.connection_args(host, opts))
            .arg(&host.endpoint.hostname)
            .arg("--")
            .args(remote)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(host = %host.endpoint, command = ?remote, "Running remote command");

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // ssh may exit before reading the script, e.g. when the connection
        // fails; the exit status then explains the broken pipe.
        let mut write_error = None;
        if let Some(body) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                if let Err(e) = write_script(&mut pipe, body).await {
                    write_error = Some(e);
                }
            }
        }

        let output = child.wait_with_output().await?;
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        };

        if result.code == CONNECTION_FAILURE_CODE {
            return Err(TransportError::Connection {
                host: host.endpoint.to_string(),
                code: result.code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        if let Some(e) = write_error {
            return Err(e.into());
        }

        Ok(result)
    }
}

async fn write_script(pipe: &mut ChildStdin, body: &str) -> std::io::Result<()> {
    pipe.write_all(body.as_bytes()).await?;
    pipe.shutdown().await
}

impl RemoteShell for SshTransport {
    async fn run(
        &self,
        host: &Host,
        command: &str,
        opts: &SshOptions,
    ) -> Result<CommandOutput, TransportError> {
        check_simple_command(command)?;
        self.exec(host, opts, &[command], None).await
    }

    async fn run_script(
        &self,
        host: &Host,
        script: &str,
        opts: &SshOptions,
    ) -> Result<CommandOutput, TransportError> {
        // The body travels on stdin so it never shows up in the remote
        // process table, where pgrep-based checks would match themselves.
        self.exec(host, opts, &["bash", "-s"], Some(script)).await
    }

    fn forward(&self, endpoint: &Endpoint, via: &Endpoint) -> Result<Tunnel, TransportError> {
        Ok(Tunnel::create(&self.program, endpoint, via)?)
    }
}

//! Scripted stand-ins for the remote shell and the sync tool.

use crate::transfer::{SyncOutcome, SyncRequest, SyncTool, TransferPhase};
use crate::transport::{check_simple_command, CommandOutput, Endpoint, Host, RemoteShell, SshOptions, Tunnel};
use crate::utils::errors::{TransportError, CONNECTION_FAILURE_CODE};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[derive(Debug, Clone)]
pub struct FakeReply {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl FakeReply {
    pub fn ok(stdout: &str) -> Self {
        Self::exit(0, "").with_stdout(stdout)
    }

    pub fn exit(code: i32, stderr: &str) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Nothing listening on the port.
    pub fn refused() -> Self {
        Self::connection_failure("ssh: connect to host ghe.example.com port 22: Connection refused")
    }

    pub fn connection_failure(stderr: &str) -> Self {
        Self::exit(CONNECTION_FAILURE_CODE, stderr)
    }

    fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub host: String,
    pub port: u16,
    /// Command text, or the script body for `run_script`
    pub command: String,
    pub script: bool,
    pub batch_mode: bool,
    pub connection_attempts: Option<u32>,
}

struct Rule {
    host: Option<String>,
    port: Option<u16>,
    needle: String,
    replies: Vec<FakeReply>,
    served: usize,
}

impl Rule {
    fn matches(&self, call: &Call) -> bool {
        self.host.as_deref().map_or(true, |h| h == call.host)
            && self.port.map_or(true, |p| p == call.port)
            && call.command.contains(&self.needle)
    }

    fn next_reply(&mut self) -> FakeReply {
        let index = self.served.min(self.replies.len() - 1);
        self.served += 1;
        self.replies[index].clone()
    }
}

struct Hook {
    host: String,
    needle: String,
    token: CancellationToken,
}

/// In-memory remote shell.
///
/// Unscripted calls succeed with empty output, except maintenance probes
/// which report idle. Successful `touch`/`rm -f` calls maintain a per-host
/// marker set.
#[derive(Default)]
pub struct FakeShell {
    rules: Mutex<Vec<Rule>>,
    hooks: Mutex<Vec<Hook>>,
    calls: Mutex<Vec<Call>>,
    markers: Mutex<BTreeSet<String>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(self, host: Option<&str>, port: Option<u16>, needle: &str, replies: Vec<FakeReply>) -> Self {
        assert!(!replies.is_empty());
        lock(&self.rules).push(Rule {
            host: host.map(str::to_string),
            port,
            needle: needle.to_string(),
            replies,
            served: 0,
        });
        self
    }

    pub fn respond(self, needle: &str, reply: FakeReply) -> Self {
        self.rule(None, None, needle, vec![reply])
    }

    pub fn respond_on(self, host: &str, needle: &str, reply: FakeReply) -> Self {
        self.rule(Some(host), None, needle, vec![reply])
    }

    pub fn respond_on_port(self, port: u16, needle: &str, reply: FakeReply) -> Self {
        self.rule(None, Some(port), needle, vec![reply])
    }

    /// Replies in order; the last one repeats.
    pub fn respond_seq(self, host: &str, needle: &str, replies: Vec<FakeReply>) -> Self {
        self.rule(Some(host), None, needle, replies)
    }

    /// Cancel `token` when `host` receives a call containing `needle`.
    pub fn cancel_on(self, host: &str, needle: &str, token: CancellationToken) -> Self {
        lock(&self.hooks).push(Hook {
            host: host.to_string(),
            needle: needle.to_string(),
            token,
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn calls_matching(&self, needle: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.command.contains(needle))
            .collect()
    }

    pub fn calls_matching_on(&self, host: &str, needle: &str) -> Vec<Call> {
        self.calls_matching(needle)
            .into_iter()
            .filter(|c| c.host == host)
            .collect()
    }

    /// Hosts currently carrying the maintenance marker.
    pub fn markers(&self) -> BTreeSet<String> {
        lock(&self.markers).clone()
    }

    async fn answer(
        &self,
        host: &Host,
        command: &str,
        opts: &SshOptions,
        script: bool,
    ) -> Result<CommandOutput, TransportError> {
        let call = Call {
            host: host.name().to_string(),
            port: host.endpoint.port,
            command: command.to_string(),
            script,
            batch_mode: opts.batch_mode,
            connection_attempts: opts.connection_attempts,
        };
        lock(&self.calls).push(call.clone());

        let scripted = lock(&self.rules)
            .iter_mut()
            .find(|rule| rule.matches(&call))
            .map(Rule::next_reply);
        let reply = scripted.unwrap_or_else(|| {
            if command.contains("pgrep") {
                FakeReply::exit(1, "")
            } else {
                FakeReply::ok("")
            }
        });

        if reply.code == 0 {
            let mut markers = lock(&self.markers);
            if command.contains("touch ") {
                markers.insert(call.host.clone());
            } else if command.contains("rm -f ") {
                markers.remove(&call.host);
            }
        }

        for hook in lock(&self.hooks).iter() {
            if hook.host == call.host && command.contains(&hook.needle) {
                hook.token.cancel();
            }
        }

        tokio::task::yield_now().await;

        if reply.code == CONNECTION_FAILURE_CODE {
            return Err(TransportError::Connection {
                host: host.endpoint.to_string(),
                code: reply.code,
                stderr: reply.stderr,
            });
        }
        Ok(CommandOutput {
            stdout: reply.stdout,
            stderr: reply.stderr,
            code: reply.code,
        })
    }
}

impl RemoteShell for FakeShell {
    async fn run(
        &self,
        host: &Host,
        command: &str,
        opts: &SshOptions,
    ) -> Result<CommandOutput, TransportError> {
        check_simple_command(command)?;
        self.answer(host, command, opts, false).await
    }

    async fn run_script(
        &self,
        host: &Host,
        script: &str,
        opts: &SshOptions,
    ) -> Result<CommandOutput, TransportError> {
        self.answer(host, script, opts, true).await
    }

    fn forward(&self, endpoint: &Endpoint, via: &Endpoint) -> Result<Tunnel, TransportError> {
        Ok(Tunnel::create("ssh", endpoint, via)?)
    }
}

/// Records every sync request. Successful phases leave a file named after
/// the phase in the destination.
#[derive(Default)]
pub struct FakeSync {
    failures: HashMap<(String, TransferPhase), i32>,
    requests: Mutex<Vec<SyncRequest>>,
}

impl FakeSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, node: &str, phase: TransferPhase, code: i32) -> Self {
        self.failures.insert((node.to_string(), phase), code);
        self
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        lock(&self.requests).clone()
    }

    pub fn phases_for(&self, node: &str) -> Vec<TransferPhase> {
        lock(&self.requests)
            .iter()
            .filter(|r| r.node == node)
            .map(|r| r.phase)
            .collect()
    }
}

impl SyncTool for FakeSync {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncOutcome, TransportError> {
        lock(&self.requests).push(request.clone());
        tokio::task::yield_now().await;

        let exit_code = self
            .failures
            .get(&(request.node.clone(), request.phase))
            .copied()
            .unwrap_or(0);
        if exit_code == 0 || exit_code == crate::transfer::VANISHED_SOURCE_FILES {
            std::fs::create_dir_all(&request.destination)?;
            std::fs::write(request.destination.join(request.phase.name()), &request.node)?;
        }

        Ok(SyncOutcome {
            exit_code,
            files_transferred: Some(1),
            stderr: String::new(),
        })
    }
}

//! Error types for the backup orchestrator.

use crate::transfer::TransferPhase;
use thiserror::Error;

/// Exit code ssh uses for connection-layer failures.
pub const CONNECTION_FAILURE_CODE: i32 = 255;

/// Failures of the remote command channel itself, as opposed to a remote
/// command that ran and returned a non-zero status.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection to {host} failed (exit {code}): {stderr}")]
    Connection {
        host: String,
        code: i32,
        stderr: String,
    },

    #[error("refusing to run `{command}` as a simple command; pipelines must use the script form")]
    Misuse { command: String },

    #[error("`{command}` on {host} exited with {code}: {stderr}")]
    Failed {
        host: String,
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The remote answered, but not as a usable instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{host} is not a recognized instance: {detail}")]
    NotRecognized { host: String, detail: String },

    #[error("{host} is not a recognized instance: unparsable version {raw:?}")]
    UnparsableVersion { host: String, raw: String },

    #[error("{host} rejected version negotiation: {message}")]
    Incompatible { host: String, message: String },

    #[error("{host} runs version {version}, but {minimum} or newer is required")]
    Unsupported {
        host: String,
        version: String,
        minimum: String,
    },

    #[error("cluster node query on {host} exited with {code}: {stderr}")]
    TopologyQuery {
        host: String,
        code: i32,
        stderr: String,
    },
}

impl ProtocolError {
    /// True for both flavours of "this is not the system we expected".
    pub fn is_not_recognized(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotRecognized { .. } | ProtocolError::UnparsableVersion { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("could not connect to {host}:{port} ({detail}); check network access and that this machine's SSH key is authorized for {user}@{host}")]
    Connectivity {
        host: String,
        port: u16,
        user: String,
        detail: String,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("maintenance on {node} did not quiesce within the cooldown period of {budget} polls")]
    QuiescenceTimeout { node: String, budget: u32 },

    #[error("{phase} transfer from {node} failed with exit code {code}")]
    Transfer {
        node: String,
        phase: TransferPhase,
        code: i32,
    },

    #[error("{0}")]
    Misuse(String),

    #[error("{node}: {source}")]
    Transport {
        node: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to re-enable maintenance on {}; remove {} on those nodes by hand", .nodes.join(", "), .marker)]
    LeaseRelease { nodes: Vec<String>, marker: String },

    #[error("backup interrupted")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Attribute a transport failure to the node it happened on.
    pub fn transport(node: impl Into<String>, source: TransportError) -> Self {
        match source {
            TransportError::Misuse { .. } => BackupError::Misuse(source.to_string()),
            source => BackupError::Transport {
                node: node.into(),
                source,
            },
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::Connectivity { .. } => CONNECTION_FAILURE_CODE,
            BackupError::Transport {
                source: TransportError::Connection { code, .. },
                ..
            } => *code,
            BackupError::Protocol(ProtocolError::NotRecognized { .. }) => 101,
            BackupError::Protocol(ProtocolError::UnparsableVersion { .. }) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

//! Ordered, filtered transfer of one node's repository storage.
//!
//! A node's five phases run strictly one after another; a phase starts only
//! once the previous one has landed on disk. Nodes are independent and may
//! be transferred in parallel by the caller.

pub mod phase;
pub mod rsync;

pub use phase::{FilterRule, TransferPhase};
pub use rsync::{RsyncTool, SyncOutcome, SyncRequest, SyncSource, SyncTool, VANISHED_SOURCE_FILES};

use crate::utils::errors::{BackupError, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Result of a node whose every phase succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub node: String,
    pub destination: PathBuf,
    pub phases: Vec<TransferPhase>,
    pub files_transferred: u64,
}

pub struct TransferPipeline<'a, T> {
    sync: &'a T,
}

impl<'a, T: SyncTool> TransferPipeline<'a, T> {
    pub fn new(sync: &'a T) -> Self {
        Self { sync }
    }

    /// Run every phase for `node` into `destination`. The first failing
    /// phase stops the node; data from earlier phases stays where it is.
    pub async fn transfer_node(
        &self,
        node: &str,
        source: &SyncSource,
        destination: &Path,
        link_dest: Option<&Path>,
    ) -> Result<NodeReport> {
        tokio::fs::create_dir_all(destination).await?;

        let mut report = NodeReport {
            node: node.to_string(),
            destination: destination.to_path_buf(),
            phases: Vec::with_capacity(TransferPhase::ALL.len()),
            files_transferred: 0,
        };

        for phase in TransferPhase::ALL {
            let request = SyncRequest {
                node: node.to_string(),
                phase,
                source: source.clone(),
                destination: destination.to_path_buf(),
                link_dest: link_dest.map(Path::to_path_buf),
                rules: phase.rules(),
                compress: phase.compress(),
                hard_links: phase.hard_links(),
            };

            let outcome = self
                .sync
                .sync(&request)
                .await
                .map_err(|e| BackupError::transport(node, e))?;

            match outcome.exit_code {
                0 => {}
                VANISHED_SOURCE_FILES => {
                    warn!(
                        node = %node,
                        phase = %phase,
                        "Some source files vanished during transfer"
                    );
                }
                code => {
                    error!(
                        node = %node,
                        phase = %phase,
                        code,
                        stderr = %outcome.stderr.trim(),
                        "Transfer phase failed"
                    );
                    return Err(BackupError::Transfer {
                        node: node.to_string(),
                        phase,
                        code,
                    });
                }
            }

            let files = outcome.files_transferred.unwrap_or(0);
            report.files_transferred += files;
            report.phases.push(phase);
            info!(node = %node, phase = %phase, files, "Transfer phase complete");
        }

        Ok(report)
    }
}

//! Backup run orchestration.
//!
//! Negotiate with the primary, expand it to storage nodes, suspend
//! maintenance everywhere, transfer every node, then release every lease no
//! matter how the run ended.

use crate::config::{ClusterMode, Config};
use crate::negotiate::{Dialect, HostNegotiator, NegotiationResult};
use crate::quiesce::{QuiesceSettings, Quiescer};
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::topology::ClusterTopology;
use crate::transfer::{NodeReport, SyncSource, SyncTool, TransferPipeline};
use crate::transport::{Endpoint, Host, RemoteShell};
use crate::utils::errors::{BackupError, Result};
use futures_util::stream::{self, StreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A storage node the run addresses.
#[derive(Debug, Clone)]
pub struct NodeTarget {
    pub node: String,
    pub host: Host,
    /// Directory under the snapshot's `repositories/`; `None` for a
    /// standalone appliance
    pub subdir: Option<String>,
}

#[derive(Debug)]
pub struct BackupReport {
    pub negotiation: NegotiationResult,
    /// `None` when the role has no members and nothing was written
    pub snapshot: Option<Snapshot>,
    pub nodes: Vec<NodeReport>,
}

impl BackupReport {
    pub fn files_transferred(&self) -> u64 {
        self.nodes.iter().map(|n| n.files_transferred).sum()
    }
}

pub struct BackupExecutor<'a, S, T> {
    config: &'a Config,
    shell: &'a S,
    sync: &'a T,
    snapshots: SnapshotManager,
}

impl<'a, S: RemoteShell, T: SyncTool> BackupExecutor<'a, S, T> {
    pub fn new(config: &'a Config, shell: &'a S, sync: &'a T) -> Self {
        Self {
            config,
            shell,
            sync,
            snapshots: SnapshotManager::new(&config.backup.data_dir),
        }
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub async fn negotiate(&self) -> Result<NegotiationResult> {
        let primary = Endpoint::parse(&self.config.host.hostname)?;
        let negotiator = HostNegotiator::from_config(
            self.shell,
            &self.config.negotiate,
            Duration::from_secs(self.config.transport.connect_timeout_secs),
        )?;
        negotiator.negotiate(&primary).await
    }

    /// Nodes holding repository data behind the negotiated primary.
    pub async fn resolve_targets(&self, negotiation: &NegotiationResult) -> Result<Vec<NodeTarget>> {
        let primary = Host::direct(negotiation.endpoint.clone());
        let topology = ClusterTopology::new(self.shell, &self.config.cluster);

        let clustered = match (negotiation.dialect, self.config.cluster.mode) {
            (Dialect::Legacy, _) | (_, ClusterMode::Standalone) => false,
            (_, ClusterMode::Cluster) => true,
            (_, ClusterMode::Auto) => topology.is_cluster(&primary).await?,
        };

        if !clustered {
            return Ok(vec![NodeTarget {
                node: primary.name().to_string(),
                host: primary,
                subdir: None,
            }]);
        }

        let via = &negotiation.endpoint;
        let mut targets = Vec::new();
        for member in topology.list_nodes(&primary, &self.config.cluster.role).await? {
            // Members share the primary's admin port and user.
            let endpoint = Endpoint {
                alias: member.name.clone(),
                hostname: member.name.clone(),
                port: via.port,
                user: via.user.clone(),
            };
            let tunnel = self
                .shell
                .forward(&endpoint, via)
                .map_err(|e| BackupError::transport(&member.name, e))?;
            targets.push(NodeTarget {
                subdir: Some(member.name.clone()),
                node: member.name,
                host: Host::via(endpoint, tunnel),
            });
        }
        Ok(targets)
    }

    /// Negotiate, then back up.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<BackupReport> {
        let negotiation = self.negotiate().await?;
        self.backup(negotiation, cancel).await
    }

    /// One full backup against an already negotiated primary. Leases are
    /// released before this returns on every path, including cancellation
    /// through `cancel`.
    pub async fn backup(
        &self,
        negotiation: NegotiationResult,
        cancel: &CancellationToken,
    ) -> Result<BackupReport> {
        let targets = self.resolve_targets(&negotiation).await?;

        if targets.is_empty() {
            warn!(role = %self.config.cluster.role, "No nodes hold this role; nothing to back up");
            return Ok(BackupReport {
                negotiation,
                snapshot: None,
                nodes: Vec::new(),
            });
        }

        let data_root = self.config.data_root(negotiation.dialect == Dialect::Legacy);
        let quiescer = Quiescer::new(self.shell, QuiesceSettings::from_config(self.config, data_root));
        let snapshot = self.snapshots.create_unique()?;

        info!(
            snapshot = %snapshot.id,
            nodes = targets.len(),
            "Starting backup"
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(snapshot = %snapshot.id, "Backup interrupted, re-enabling maintenance");
                Err(BackupError::Cancelled)
            }
            result = self.quiesce_and_transfer(&quiescer, &targets, &snapshot, data_root) => result,
        };

        let unreleased = quiescer.release_all().await;
        let nodes = match outcome {
            Err(err) => {
                if !unreleased.is_empty() {
                    error!(nodes = ?unreleased, marker = %quiescer.marker(), "Maintenance left suspended");
                }
                return Err(err);
            }
            Ok(_) if !unreleased.is_empty() => {
                return Err(BackupError::LeaseRelease {
                    nodes: unreleased,
                    marker: quiescer.marker().to_string(),
                });
            }
            Ok(nodes) => nodes,
        };

        self.snapshots.finalize(&snapshot)?;
        Ok(BackupReport {
            negotiation,
            snapshot: Some(snapshot),
            nodes,
        })
    }

    async fn quiesce_and_transfer(
        &self,
        quiescer: &Quiescer<'_, S>,
        targets: &[NodeTarget],
        snapshot: &Snapshot,
        data_root: &str,
    ) -> Result<Vec<NodeReport>> {
        let hosts: Vec<Host> = targets.iter().map(|t| t.host.clone()).collect();
        quiescer.suspend_all(&hosts).await?;

        let pipeline = TransferPipeline::new(self.sync);
        let pipeline = &pipeline;
        let remote_path = format!("{}/repositories", data_root.trim_end_matches('/'));
        let remote_path = remote_path.as_str();

        // Every node runs to completion so healthy nodes keep their data;
        // the first failure in node order decides the result.
        let results: Vec<Result<NodeReport>> = stream::iter(targets)
            .map(|target| async move {
                let destination = match &target.subdir {
                    Some(subdir) => snapshot.repositories_dir().join(subdir),
                    None => snapshot.repositories_dir(),
                };
                let link_dest = self.snapshots.link_dest(target.subdir.as_deref());
                let source = SyncSource::Remote {
                    host: target.host.clone(),
                    path: remote_path.to_string(),
                };
                pipeline
                    .transfer_node(&target.node, &source, &destination, link_dest.as_deref())
                    .await
            })
            .buffered(self.config.backup.max_parallel_nodes.max(1))
            .collect()
            .await;

        let mut reports = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!(error = %err, "Node transfer failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiesce::MARKER_NAME;
    use crate::testutil::{FakeReply, FakeShell, FakeSync};
    use crate::transfer::TransferPhase;
    use std::fs;
    use tempfile::TempDir;

    const VERSION_REPLY: &str = "GitHub Enterprise version 3.9.2\n";

    fn config(data_dir: &TempDir, mode: ClusterMode) -> Config {
        let mut config = Config::default();
        config.host.hostname = "ghe.example.com".into();
        config.backup.data_dir = data_dir.path().to_path_buf();
        config.quiesce.poll_interval_ms = 0;
        config.cluster.mode = mode;
        config
    }

    fn cluster_shell() -> FakeShell {
        FakeShell::new()
            .respond("ghe-negotiate-version", FakeReply::ok(VERSION_REPLY))
            .respond("ghe-cluster-each", FakeReply::ok("node-a\nnode-b\n"))
    }

    fn busy(times: usize) -> Vec<FakeReply> {
        let mut replies = vec![FakeReply::exit(0, ""); times];
        replies.push(FakeReply::exit(1, ""));
        replies
    }

    fn assert_released_once(shell: &FakeShell) {
        assert!(shell.markers().is_empty(), "markers left: {:?}", shell.markers());
        for touch in shell.calls_matching("touch ") {
            assert_eq!(shell.calls_matching_on(&touch.host, "rm -f ").len(), 1, "{}", touch.host);
        }
    }

    #[tokio::test]
    async fn test_two_node_backup() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Cluster);
        let shell = cluster_shell()
            .respond_seq("node-a", "pgrep", busy(2))
            .respond_seq("node-b", "pgrep", busy(1));
        let sync = FakeSync::new();

        let executor = BackupExecutor::new(&config, &shell, &sync);
        let report = executor.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.nodes.len(), 2);
        assert_eq!(shell.calls_matching_on("node-a", "pgrep").len(), 3);
        assert_released_once(&shell);
        assert_eq!(shell.calls_matching("rm -f ").len(), 2);

        let snapshot = report.snapshot.unwrap();
        assert!(snapshot.is_complete());
        for node in ["node-a", "node-b"] {
            assert_eq!(sync.phases_for(node), TransferPhase::ALL.to_vec());
            assert!(snapshot.repositories_dir().join(node).join("special-dirs").is_file());
        }

        // Sources come from the node's repository root through the tunnel.
        let request = &sync.requests()[0];
        match &request.source {
            SyncSource::Remote { host, path } => {
                assert_eq!(path, "/data/user/repositories");
                assert!(host.tunnel.is_some());
                assert_eq!(host.endpoint.port, 22);
            }
            other => panic!("unexpected source {other:?}"),
        }
        assert!(request.rules.iter().any(|r| r.to_string() == format!("- /{MARKER_NAME}")));
    }

    #[tokio::test]
    async fn test_object_phase_failure_on_one_node() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Cluster);
        let shell = cluster_shell();
        let sync = FakeSync::new().fail("node-b", TransferPhase::ObjectsAndPacks, 12);

        let executor = BackupExecutor::new(&config, &shell, &sync);
        let err = executor.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.exit_code(), 1);
        let message = err.to_string();
        assert!(message.contains("node-b") && message.contains("objects-and-packs"), "{message}");

        // node-a finished, node-b stopped after the failing phase.
        assert_eq!(sync.phases_for("node-a").len(), 5);
        assert_eq!(sync.phases_for("node-b").len(), 4);

        let snapshot = executor.snapshots().list().unwrap().pop().unwrap();
        assert!(!snapshot.is_complete());
        assert!(snapshot.repositories_dir().join("node-a/objects-and-packs").is_file());
        assert!(!snapshot.repositories_dir().join("node-b/objects-and-packs").exists());

        assert_released_once(&shell);
        assert_eq!(shell.calls_matching_on("node-b", "rm -f ").len(), 1);
    }

    #[tokio::test]
    async fn test_drain_timeout_releases_every_node() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, ClusterMode::Cluster);
        config.quiesce.cooldown_period = 3;
        let shell = cluster_shell().respond_on("node-b", "pgrep", FakeReply::exit(0, ""));
        let sync = FakeSync::new();

        let err = BackupExecutor::new(&config, &shell, &sync)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::QuiescenceTimeout { ref node, budget: 3 } if node == "node-b"));
        assert_eq!(shell.calls_matching_on("node-b", "pgrep").len(), 3);
        assert!(sync.requests().is_empty());
        assert_released_once(&shell);
        assert_eq!(shell.calls_matching("rm -f ").len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_after_lease_granted() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Cluster);
        let cancel = CancellationToken::new();
        let shell = cluster_shell().cancel_on("node-a", "pgrep", cancel.clone());
        let sync = FakeSync::new();

        let err = BackupExecutor::new(&config, &shell, &sync)
            .run(&cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Cancelled));
        assert!(sync.requests().is_empty());
        assert!(!shell.calls_matching_on("node-a", "rm -f ").is_empty());
        assert_released_once(&shell);
    }

    #[tokio::test]
    async fn test_release_failure_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Cluster);
        let shell = cluster_shell().respond_on("node-a", "rm -f", FakeReply::exit(1, "read-only file system\n"));
        let sync = FakeSync::new();

        let executor = BackupExecutor::new(&config, &shell, &sync);
        let err = executor.run(&CancellationToken::new()).await.unwrap_err();

        match err {
            BackupError::LeaseRelease { nodes, marker } => {
                assert_eq!(nodes, vec!["node-a".to_string()]);
                assert_eq!(marker, "/data/user/repositories/.sync_in_progress");
            }
            other => panic!("unexpected {other}"),
        }
        let snapshot = executor.snapshots().list().unwrap().pop().unwrap();
        assert!(!snapshot.is_complete());
    }

    #[tokio::test]
    async fn test_empty_role_backs_up_nothing() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Cluster);
        let shell = FakeShell::new()
            .respond("ghe-negotiate-version", FakeReply::ok(VERSION_REPLY))
            .respond("ghe-cluster-each", FakeReply::ok("\n"));
        let sync = FakeSync::new();

        let executor = BackupExecutor::new(&config, &shell, &sync);
        let report = executor.run(&CancellationToken::new()).await.unwrap();

        assert!(report.nodes.is_empty());
        assert!(report.snapshot.is_none());
        assert!(shell.calls_matching("touch ").is_empty());
        assert!(executor.snapshots().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_standalone_appliance() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Auto);
        let shell = FakeShell::new()
            .respond("ghe-negotiate-version", FakeReply::ok(VERSION_REPLY))
            .respond("test -f /etc/github/cluster", FakeReply::exit(1, ""));
        let sync = FakeSync::new();

        let report = BackupExecutor::new(&config, &shell, &sync)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.nodes.len(), 1);
        assert_eq!(report.nodes[0].node, "ghe.example.com");
        let snapshot = report.snapshot.unwrap();
        assert!(snapshot.repositories_dir().join("auxiliary").is_file());
        assert!(shell.calls_matching("ghe-cluster-each").is_empty());
        assert_released_once(&shell);
    }

    #[tokio::test]
    async fn test_legacy_dialect_uses_legacy_root() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Cluster);
        let shell = FakeShell::new()
            .respond("ghe-negotiate-version", FakeReply::exit(127, ""))
            .respond("chef_metadata.json", FakeReply::ok(r#"{"version":"11.10.344"}"#));
        let sync = FakeSync::new();

        let report = BackupExecutor::new(&config, &shell, &sync)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.negotiation.dialect, Dialect::Legacy);
        assert_eq!(shell.calls_matching("touch /data/repositories/.sync_in_progress").len(), 1);
        assert!(shell.calls_matching("ghe-cluster-each").is_empty());
    }

    #[tokio::test]
    async fn test_previous_snapshot_is_link_dest() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Cluster);
        let shell = cluster_shell();
        let sync = FakeSync::new();

        let executor = BackupExecutor::new(&config, &shell, &sync);
        let previous = executor.snapshots().create("20000101T000000").unwrap();
        fs::create_dir_all(previous.repositories_dir().join("node-a")).unwrap();
        executor.snapshots().finalize(&previous).unwrap();
        executor.snapshots().promote(&previous).unwrap();

        executor.run(&CancellationToken::new()).await.unwrap();

        let expected = fs::canonicalize(previous.repositories_dir().join("node-a")).unwrap();
        for request in sync.requests() {
            match request.node.as_str() {
                "node-a" => assert_eq!(request.link_dest.as_deref(), Some(expected.as_path())),
                _ => assert_eq!(request.link_dest, None),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_run_right_after_promotion_keeps_current_intact() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Cluster);
        let shell = cluster_shell();

        let sync = FakeSync::new();
        let executor = BackupExecutor::new(&config, &shell, &sync);
        let first = executor.run(&CancellationToken::new()).await.unwrap().snapshot.unwrap();
        executor.snapshots().promote(&first).unwrap();

        // Typically within the same second as the first run.
        let failing = FakeSync::new().fail("node-a", TransferPhase::ObjectsAndPacks, 12);
        let executor = BackupExecutor::new(&config, &shell, &failing);
        executor.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(executor.snapshots().current_id().as_deref(), Some(first.id.as_str()));
        assert!(first.is_complete());
        let previous = fs::canonicalize(first.repositories_dir().join("node-a")).unwrap();
        for request in failing.requests() {
            assert!(!request.destination.starts_with(&first.dir), "{:?}", request.destination);
            if request.node == "node-a" {
                assert_eq!(request.link_dest.as_deref(), Some(previous.as_path()));
            }
        }
    }

    #[tokio::test]
    async fn test_negotiation_failure_touches_no_node() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, ClusterMode::Cluster);
        let shell = FakeShell::new().respond("ghe-negotiate-version", FakeReply::ok("Welcome\n"));
        let sync = FakeSync::new();

        let err = BackupExecutor::new(&config, &shell, &sync)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Protocol(ref p) if p.is_not_recognized()));
        assert_eq!(err.exit_code(), 101);
        assert!(shell.calls_matching("touch ").is_empty());
    }
}

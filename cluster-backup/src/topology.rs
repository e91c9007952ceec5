//! Cluster membership discovery.
//!
//! Membership is queried fresh on every run; nodes can join or leave
//! between backups.

use crate::config::ClusterConfig;
use crate::transport::{shell_quote, Host, RemoteShell, SshOptions};
use crate::utils::errors::{BackupError, ProtocolError, Result};

/// Marker present on every member of a clustered deployment.
const CLUSTER_MARKER: &str = "/etc/github/cluster";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// Hostname token as reported by the cluster
    pub name: String,
    pub role: String,
}

pub struct ClusterTopology<'a, S> {
    shell: &'a S,
    node_query: String,
}

impl<'a, S: RemoteShell> ClusterTopology<'a, S> {
    pub fn new(shell: &'a S, config: &ClusterConfig) -> Self {
        Self {
            shell,
            node_query: config.node_query.clone(),
        }
    }

    /// Whether the primary belongs to a cluster.
    pub async fn is_cluster(&self, primary: &Host) -> Result<bool> {
        let command = format!("test -f {CLUSTER_MARKER}");
        let output = self
            .shell
            .run(primary, &command, &SshOptions::batch())
            .await
            .map_err(|e| BackupError::transport(primary.name(), e))?;

        match output.code {
            0 => Ok(true),
            1 => Ok(false),
            code => Err(ProtocolError::TopologyQuery {
                host: primary.endpoint.to_string(),
                code,
                stderr: output.stderr.trim().to_string(),
            }
            .into()),
        }
    }

    /// Live members of `role`. An empty list means the role has no members.
    pub async fn list_nodes(&self, primary: &Host, role: &str) -> Result<Vec<ClusterNode>> {
        let command = self.node_query.replace("{role}", &shell_quote(role));
        let output = self
            .shell
            .run(primary, &command, &SshOptions::batch())
            .await
            .map_err(|e| BackupError::transport(primary.name(), e))?;

        if !output.success() {
            return Err(ProtocolError::TopologyQuery {
                host: primary.endpoint.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }

        let nodes = parse_node_list(&output.stdout, role);
        tracing::info!(
            primary = %primary.endpoint,
            role,
            count = nodes.len(),
            "Discovered cluster nodes"
        );
        Ok(nodes)
    }
}

/// Split whitespace-separated hostnames, dropping repeats.
pub fn parse_node_list(stdout: &str, role: &str) -> Vec<ClusterNode> {
    let mut nodes: Vec<ClusterNode> = Vec::new();
    for token in stdout.split_whitespace() {
        if nodes.iter().any(|n| n.name == token) {
            continue;
        }
        nodes.push(ClusterNode {
            name: token.to_string(),
            role: role.to_string(),
        });
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeReply, FakeShell};
    use crate::transport::Endpoint;

    fn primary() -> Host {
        Host::direct(Endpoint::parse("ghe.example.com:122").unwrap())
    }

    #[test]
    fn test_parse_node_list() {
        let nodes = parse_node_list("git-server-1\ngit-server-2 git-server-1\n\n", "git");
        let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["git-server-1", "git-server-2"]);
        assert!(nodes.iter().all(|n| n.role == "git"));
    }

    #[tokio::test]
    async fn test_list_nodes_uses_role() {
        let shell = FakeShell::new()
            .respond("ghe-cluster-each", FakeReply::ok("git-server-1\ngit-server-2\n"));
        let topology = ClusterTopology::new(&shell, &ClusterConfig::default());

        let nodes = topology.list_nodes(&primary(), "git").await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(shell.calls()[0].command, "ghe-cluster-each -r git -p");
    }

    #[tokio::test]
    async fn test_empty_role_is_not_an_error() {
        let shell = FakeShell::new().respond("ghe-cluster-each", FakeReply::ok(""));
        let topology = ClusterTopology::new(&shell, &ClusterConfig::default());

        let nodes = topology.list_nodes(&primary(), "pages").await.unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_query_failure() {
        let shell = FakeShell::new()
            .respond("ghe-cluster-each", FakeReply::exit(2, "unknown role\n"));
        let topology = ClusterTopology::new(&shell, &ClusterConfig::default());

        let err = topology.list_nodes(&primary(), "git").await.unwrap_err();
        assert!(matches!(err, BackupError::Protocol(ProtocolError::TopologyQuery { code: 2, .. })));
    }

    #[tokio::test]
    async fn test_cluster_detection() {
        let shell = FakeShell::new().respond("test -f /etc/github/cluster", FakeReply::exit(1, ""));
        let topology = ClusterTopology::new(&shell, &ClusterConfig::default());
        assert!(!topology.is_cluster(&primary()).await.unwrap());

        let shell = FakeShell::new().respond("test -f /etc/github/cluster", FakeReply::ok(""));
        let topology = ClusterTopology::new(&shell, &ClusterConfig::default());
        assert!(topology.is_cluster(&primary()).await.unwrap());
    }
}

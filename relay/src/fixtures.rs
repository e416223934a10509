//! Canned cluster data served by the loopback relay.

use anyhow::{Context, Result};
use kubetap_shared::protocol::{ClusterStatus, NodeInfo, NodeList, NodeResources};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Status and node data answered to single-shot queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub status: ClusterStatus,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
}

impl Default for Fixtures {
    fn default() -> Self {
        Self {
            status: ClusterStatus {
                status: "running".to_string(),
                kubernetes_version: Some("v1.29.0".to_string()),
                ..ClusterStatus::default()
            },
            nodes: vec![NodeInfo {
                name: "loopback".to_string(),
                ready: true,
                roles: vec!["control-plane".to_string()],
                kubelet_version: Some("v1.29.0".to_string()),
                allocatable: Some(NodeResources {
                    cpu_milli: 2000,
                    memory_mib: 4096,
                    pods: 110,
                }),
                ..NodeInfo::default()
            }],
        }
    }
}

impl Fixtures {
    /// Load fixtures from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixtures: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fixtures: {}", path.display()))
    }

    /// Status document for `cluster`; node counts default to the fixture nodes.
    pub fn status_for(&self, cluster: &str) -> ClusterStatus {
        let mut status = self.status.clone();
        status.cluster_id = cluster.to_string();
        if status.nodes_total == 0 {
            status.nodes_total = self.nodes.len() as u32;
            status.nodes_ready = self.nodes.iter().filter(|n| n.ready).count() as u32;
        }
        status
    }

    pub fn node_list(&self) -> NodeList {
        NodeList {
            nodes: self.nodes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_counts_nodes() {
        let fixtures = Fixtures::default();
        let status = fixtures.status_for("c-42");
        assert_eq!(status.cluster_id, "c-42");
        assert_eq!(status.nodes_total, 1);
        assert_eq!(status.nodes_ready, 1);
    }

    #[test]
    fn test_parse_partial_fixture() {
        let fixtures: Fixtures =
            serde_json::from_str(r#"{"nodes":[{"name":"a","ready":false},{"name":"b","ready":true}]}"#)
                .unwrap();
        let status = fixtures.status_for("x");
        assert_eq!(status.nodes_total, 2);
        assert_eq!(status.nodes_ready, 1);
        assert_eq!(fixtures.node_list().nodes[0].name, "a");
    }
}

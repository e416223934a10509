//! Request and response types for kubetap relay communication.
//!
//! Requests travel entirely in the handshake URL query string; each request
//! type declares the relay path it targets and which protocol mode answers it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CLUSTER_STATUS_PATH: &str = "/cluster/status";
pub const CLUSTER_NODES_PATH: &str = "/cluster/nodes";
pub const SHELL_DEBUG_PATH: &str = "/shell/debug";
pub const SHELL_EXEC_PATH: &str = "/shell/exec";
pub const PORT_FORWARD_PATH: &str = "/port-forward";

/// How the relay answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    /// Exactly one text frame holding a JSON document.
    Query,
    /// A long-lived duplex byte relay.
    Tunnel(SessionKind),
}

/// Kind of duplex session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Shell,
    PortForward,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Shell => write!(f, "shell"),
            SessionKind::PortForward => write!(f, "port-forward"),
        }
    }
}

/// A request carried in the URL query of a relay handshake.
pub trait TunnelRequest: Serialize {
    /// Relay path appended to the base URL.
    const PATH: &'static str;
    /// Protocol mode the relay uses to answer.
    const MODE: ProtocolMode;
}

/// A request answered by a single JSON document.
pub trait QueryRequest: TunnelRequest {
    type Response: DeserializeOwned;
}

/// A request that opens an interactive shell.
pub trait ShellTarget: TunnelRequest {
    /// Record the local terminal size so the remote pty starts with it.
    fn set_terminal_size(&mut self, size: TerminalSize);
}

/// Cluster status request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatusRequest {
    pub organization: String,
    pub cluster: String,
}

impl TunnelRequest for ClusterStatusRequest {
    const PATH: &'static str = CLUSTER_STATUS_PATH;
    const MODE: ProtocolMode = ProtocolMode::Query;
}

impl QueryRequest for ClusterStatusRequest {
    type Response = ClusterStatus;
}

/// Node listing request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNodesRequest {
    pub organization: String,
    pub cluster: String,
}

impl TunnelRequest for ClusterNodesRequest {
    const PATH: &'static str = CLUSTER_NODES_PATH;
    const MODE: ProtocolMode = ProtocolMode::Query;
}

impl QueryRequest for ClusterNodesRequest {
    type Response = NodeList;
}

/// Privilege flavor of a debug pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugPrivilege {
    #[default]
    Standard,
    Full,
}

impl std::fmt::Display for DebugPrivilege {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebugPrivilege::Standard => write!(f, "standard"),
            DebugPrivilege::Full => write!(f, "full"),
        }
    }
}

/// Debug pod request: a shell in a fresh pod scheduled on a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugPodRequest {
    pub organization: String,
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<String>,
    #[serde(default)]
    pub privilege: DebugPrivilege,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty_width: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty_height: Option<u16>,
}

impl TunnelRequest for DebugPodRequest {
    const PATH: &'static str = SHELL_DEBUG_PATH;
    const MODE: ProtocolMode = ProtocolMode::Tunnel(SessionKind::Shell);
}

impl ShellTarget for DebugPodRequest {
    fn set_terminal_size(&mut self, size: TerminalSize) {
        self.tty_width = Some(size.width);
        self.tty_height = Some(size.height);
    }
}

/// Shell request: exec into a running service pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellRequest {
    pub organization: String,
    pub project: String,
    pub environment: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty_width: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty_height: Option<u16>,
}

impl TunnelRequest for ShellRequest {
    const PATH: &'static str = SHELL_EXEC_PATH;
    const MODE: ProtocolMode = ProtocolMode::Tunnel(SessionKind::Shell);
}

impl ShellTarget for ShellRequest {
    fn set_terminal_size(&mut self, size: TerminalSize) {
        self.tty_width = Some(size.width);
        self.tty_height = Some(size.height);
    }
}

/// Port forward request. `port` is filled in per forwarded connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRequest {
    pub organization: String,
    pub project: String,
    pub environment: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl PortForwardRequest {
    /// Copy of this request targeting one remote port.
    pub fn for_port(&self, port: u16) -> Self {
        Self {
            port: Some(port),
            ..self.clone()
        }
    }
}

impl TunnelRequest for PortForwardRequest {
    const PATH: &'static str = PORT_FORWARD_PATH;
    const MODE: ProtocolMode = ProtocolMode::Tunnel(SessionKind::PortForward);
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    #[serde(rename = "Width")]
    pub width: u16,
    #[serde(rename = "Height")]
    pub height: u16,
}

impl TerminalSize {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

/// Live cluster status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub kubernetes_version: Option<String>,
    #[serde(default)]
    pub nodes_ready: u32,
    #[serde(default)]
    pub nodes_total: u32,
    #[serde(default)]
    pub message: Option<String>,
}

impl ClusterStatus {
    pub fn is_healthy(&self) -> bool {
        self.nodes_total > 0 && self.nodes_ready == self.nodes_total
    }
}

/// Node listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeList {
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub kubelet_version: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub allocatable: Option<NodeResources>,
    #[serde(default)]
    pub pods: Vec<PodSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    #[serde(default)]
    pub cpu_milli: u64,
    #[serde(default)]
    pub memory_mib: u64,
    #[serde(default)]
    pub pods: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSummary {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub phase: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_list_decodes_sparse_document() {
        let list: NodeList = serde_json::from_str(r#"{"nodes":[{"name":"a"}]}"#).unwrap();
        assert_eq!(list.nodes.len(), 1);
        assert_eq!(list.nodes[0].name, "a");
        assert!(!list.nodes[0].ready);
        assert!(list.nodes[0].labels.is_empty());
    }

    #[test]
    fn test_cluster_status_ignores_unknown_fields() {
        let status: ClusterStatus = serde_json::from_str(
            r#"{"cluster_id":"c1","status":"running","nodes_ready":3,"nodes_total":3,"extra":true}"#,
        )
        .unwrap();
        assert_eq!(status.cluster_id, "c1");
        assert!(status.is_healthy());
    }

    #[test]
    fn test_terminal_size_wire_names() {
        let json = serde_json::to_string(&TerminalSize::new(120, 40)).unwrap();
        assert_eq!(json, r#"{"Width":120,"Height":40}"#);
    }

    #[test]
    fn test_request_modes() {
        assert_eq!(ClusterNodesRequest::MODE, ProtocolMode::Query);
        assert_eq!(DebugPodRequest::MODE, ProtocolMode::Tunnel(SessionKind::Shell));
        assert_eq!(PortForwardRequest::PATH, "/port-forward");
    }

    #[test]
    fn test_for_port_keeps_target() {
        let req = PortForwardRequest {
            organization: "o".into(),
            project: "p".into(),
            environment: "e".into(),
            service: "s".into(),
            pod_name: Some("web-0".into()),
            port: None,
        };
        let scoped = req.for_port(5432);
        assert_eq!(scoped.port, Some(5432));
        assert_eq!(scoped.pod_name.as_deref(), Some("web-0"));
        assert_eq!(req.port, None);
    }
}

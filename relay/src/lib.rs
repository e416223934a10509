//! kubetap loopback relay
//!
//! Implements the relay side of the kubetap tunnel protocol against the local
//! machine: canned cluster data for queries, local processes for shells and
//! local TCP ports for port forwarding.

use axum::{extract::State, routing::get, Router};
use kubetap_shared::protocol::{
    CLUSTER_NODES_PATH, CLUSTER_STATUS_PATH, PORT_FORWARD_PATH, SHELL_DEBUG_PATH, SHELL_EXEC_PATH,
};
use std::sync::Arc;
use tokio::net::TcpListener;

pub mod auth;
pub mod fixtures;
mod forward;
mod query;
pub mod shell;
pub mod tunnel;

use fixtures::Fixtures;
use tunnel::SessionTable;

#[derive(Clone)]
pub struct RelayState {
    token: Arc<str>,
    fixtures: Arc<Fixtures>,
    forward_host: Arc<str>,
    sessions: SessionTable,
}

impl RelayState {
    pub fn new(token: impl Into<String>, fixtures: Fixtures) -> Self {
        Self {
            token: Arc::from(token.into()),
            fixtures: Arc::new(fixtures),
            forward_host: Arc::from("127.0.0.1"),
            sessions: SessionTable::new(),
        }
    }

    /// Host that forwarded ports are dialed on.
    pub fn with_forward_host(mut self, host: impl Into<String>) -> Self {
        self.forward_host = Arc::from(host.into());
        self
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route(CLUSTER_STATUS_PATH, get(query::cluster_status))
        .route(CLUSTER_NODES_PATH, get(query::cluster_nodes))
        .route(SHELL_EXEC_PATH, get(shell::shell))
        .route(SHELL_DEBUG_PATH, get(shell::shell))
        .route(PORT_FORWARD_PATH, get(forward::port_forward))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<RelayState>) -> String {
    format!("OK {} active session(s)", state.sessions.len())
}

/// Serve the relay on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    async fn spawn() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, RelayState::new("secret", Fixtures::default())));
        addr
    }

    fn status_of(err: WsError) -> u16 {
        match err {
            WsError::Http(resp) => resp.status().as_u16(),
            other => panic!("expected HTTP rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let addr = spawn().await;
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: relay\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("OK 0 active session(s)"));
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let addr = spawn().await;
        let url = format!("ws://{}/cluster/status?organization=o&cluster=c", addr);
        let err = connect_async(url).await.unwrap_err();
        assert_eq!(status_of(err), 401);
    }

    #[tokio::test]
    async fn test_status_answer_is_single_text_frame() {
        let addr = spawn().await;
        let mut request = format!("ws://{}/cluster/status?organization=o&cluster=c-7", addr)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("authorization", HeaderValue::from_static("Bearer secret"));
        let (mut ws, _) = connect_async(request).await.unwrap();

        let Some(Ok(Message::Text(body))) = ws.next().await else {
            panic!("expected a text frame");
        };
        let status: kubetap_shared::protocol::ClusterStatus = serde_json::from_str(&body).unwrap();
        assert_eq!(status.cluster_id, "c-7");
        assert!(matches!(ws.next().await, Some(Ok(Message::Close(_))) | None));
    }

    #[tokio::test]
    async fn test_port_forward_requires_port() {
        let addr = spawn().await;
        let url = format!(
            "ws://{}/port-forward?organization=o&project=p&environment=e&service=s",
            addr
        );
        let mut request = url
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("authorization", HeaderValue::from_static("Bearer secret"));
        let err = connect_async(request).await.unwrap_err();
        assert_eq!(status_of(err), 400);
    }
}

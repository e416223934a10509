//! Port-forward endpoint: one WebSocket per forwarded TCP connection.

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use kubetap_shared::protocol::{PortForwardRequest, SessionKind};
use serde_json::json;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::auth::authorize;
use crate::tunnel::SessionTable;
use crate::RelayState;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn port_forward(
    State(state): State<RelayState>,
    headers: HeaderMap,
    query: Result<Query<PortForwardRequest>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = authorize(&headers, &state.token) {
        return resp;
    }
    let Query(request) = match query {
        Ok(q) => q,
        Err(rejection) => return rejection.into_response(),
    };
    let Some(port) = request.port else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing port"}))).into_response();
    };

    // Connect before upgrading so a closed remote port refuses the handshake.
    let target = match TcpStream::connect((state.forward_host.as_ref(), port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Port {} on {} unreachable: {}", port, state.forward_host, e);
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("port {} is not reachable: {}", port, e)})),
            )
                .into_response();
        }
    };

    let sessions = state.sessions.clone();
    let label = format!("{}:{}", request.service, port);
    ws.on_upgrade(move |socket| relay_tcp(socket, target, sessions, label))
}

async fn relay_tcp(socket: WebSocket, target: TcpStream, sessions: SessionTable, label: String) {
    let _guard = sessions.open(SessionKind::PortForward, label);
    let (mut sink, mut stream) = socket.split();
    let (mut reader, mut writer) = target.into_split();

    // Runs until the client closes the channel; an empty frame only ends
    // the target's input.
    let upstream = async move {
        let mut write_open = true;
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) if data.is_empty() => {
                    if write_open {
                        debug!("Client finished writing");
                        writer.shutdown().await?;
                        write_open = false;
                    }
                }
                Ok(Message::Binary(data)) if write_open => writer.write_all(&data).await?,
                Ok(Message::Binary(_)) => {}
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(io::Error::other(e)),
            }
        }
        if write_open {
            writer.shutdown().await?;
        }
        Ok::<_, io::Error>(())
    };

    let downstream = async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.send(Message::Binary(buf[..n].to_vec()))
                .await
                .map_err(io::Error::other)?;
        }
        let _ = sink.send(Message::Close(None)).await;
        Ok::<_, io::Error>(())
    };

    tokio::pin!(upstream);
    tokio::select! {
        up = &mut upstream => {
            if let Err(e) = up {
                debug!("Upstream ended with error: {}", e);
            }
        }
        down = downstream => {
            if let Err(e) = down {
                debug!("Downstream ended with error: {}", e);
            }
            // Wait for the client to acknowledge the close.
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut upstream).await {
                Ok(Err(e)) => debug!("Upstream ended with error: {}", e),
                Ok(Ok(())) => {}
                Err(_) => debug!("Client did not close within {:?}", DRAIN_TIMEOUT),
            }
        }
    }
}

//! Single-shot query endpoints: one text frame, then close.

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use kubetap_shared::protocol::{ClusterNodesRequest, ClusterStatusRequest};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::authorize;
use crate::RelayState;

pub(crate) async fn cluster_status(
    State(state): State<RelayState>,
    headers: HeaderMap,
    query: Result<Query<ClusterStatusRequest>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = authorize(&headers, &state.token) {
        return resp;
    }
    let Query(request) = match query {
        Ok(q) => q,
        Err(rejection) => return rejection.into_response(),
    };
    info!("Status query: org={} cluster={}", request.organization, request.cluster);
    answer(ws, &state.fixtures.status_for(&request.cluster))
}

pub(crate) async fn cluster_nodes(
    State(state): State<RelayState>,
    headers: HeaderMap,
    query: Result<Query<ClusterNodesRequest>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = authorize(&headers, &state.token) {
        return resp;
    }
    let Query(request) = match query {
        Ok(q) => q,
        Err(rejection) => return rejection.into_response(),
    };
    info!("Node query: org={} cluster={}", request.organization, request.cluster);
    answer(ws, &state.fixtures.node_list())
}

fn answer<T: Serialize>(ws: WebSocketUpgrade, document: &T) -> Response {
    let body = match serde_json::to_string(document) {
        Ok(b) => b,
        Err(e) => {
            warn!("Serialization error: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error").into_response();
        }
    };
    ws.on_upgrade(move |socket| send_once(socket, body))
}

async fn send_once(mut socket: WebSocket, body: String) {
    if let Err(e) = socket.send(Message::Text(body)).await {
        warn!("Failed to send query answer: {}", e);
        return;
    }
    let _ = socket.send(Message::Close(None)).await;
}

//! Single-shot query client: one handshake, one JSON text frame, close.

use futures_util::{Stream, StreamExt};
use kubetap_shared::protocol::QueryRequest;
use kubetap_shared::{Error, Result};
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::connect::{transport_error, truncate, Establisher};

const MAX_FRAME_PREVIEW: usize = 256;

/// Runs read-only queries. Each call uses its own connection.
#[derive(Debug, Clone)]
pub struct QueryClient {
    establisher: Establisher,
}

impl QueryClient {
    pub fn new(establisher: Establisher) -> Self {
        Self { establisher }
    }

    /// Open a session for `request`, decode the single response frame and
    /// close the connection whatever the outcome.
    pub async fn query<R: QueryRequest>(&self, request: &R) -> Result<R::Response> {
        let mut ws = self.establisher.open_request(request).await?;
        let result = read_single_response(&mut ws).await;
        if let Err(e) = ws.close(None).await {
            debug!("Close after query failed: {}", e);
        }
        result
    }
}

/// Read frames until the first data frame and decode it as `T`.
pub(crate) async fn read_single_response<S, T>(stream: &mut S) -> Result<T>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    T: DeserializeOwned,
{
    loop {
        match stream.next().await {
            // Control frames from the relay's own keepalive are not the answer.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(msg)) => return decode_single_frame(msg),
            Some(Err(e)) => return Err(transport_error(e)),
            None => return Err(Error::ClosedBeforeResponse),
        }
    }
}

fn decode_single_frame<T: DeserializeOwned>(msg: Message) -> Result<T> {
    let (kind, payload) = match msg {
        Message::Text(text) => return serde_json::from_str(&text).map_err(Error::MalformedResponse),
        Message::Close(_) => return Err(Error::ClosedBeforeResponse),
        Message::Binary(data) => ("binary", data),
        Message::Ping(data) => ("ping", data),
        Message::Pong(data) => ("pong", data),
        Message::Frame(frame) => ("raw", frame.into_data()),
    };
    let mut preview = String::from_utf8_lossy(&payload).into_owned();
    truncate(&mut preview, MAX_FRAME_PREVIEW);
    Err(Error::ProtocolViolation {
        kind,
        len: payload.len(),
        preview,
    })
}

//! Test helpers: in-process loopback relay and scripted WebSocket servers.

use std::future::Future;
use std::sync::{Arc, Mutex};

use kubetap_relay::fixtures::Fixtures;
use kubetap_relay::RelayState;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use crate::connect::Establisher;
use crate::credentials::{Credentials, StaticCredentials};

pub(crate) const TOKEN: &str = "test-token";

/// Start a loopback relay with default fixtures; returns its base URL.
pub(crate) async fn spawn_relay() -> String {
    spawn_relay_with(Fixtures::default()).await
}

pub(crate) async fn spawn_relay_with(fixtures: Fixtures) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(kubetap_relay::serve(listener, RelayState::new(TOKEN, fixtures)));
    format!("ws://{}", addr)
}

pub(crate) fn establisher(base: &str) -> Establisher {
    establisher_with_token(base, TOKEN)
}

pub(crate) fn establisher_with_token(base: &str, token: &str) -> Establisher {
    Establisher::new(base, StaticCredentials::new(Credentials::bearer(token))).unwrap()
}

/// Handshake details seen by a scripted server
#[derive(Debug, Clone, Default)]
pub(crate) struct Handshake {
    pub uri: String,
    pub authorization: Option<String>,
}

/// Accept a single WebSocket connection and run `script` on it. The handle
/// yields the handshake once the script finished, propagating its panics.
pub(crate) async fn scripted_server<F, Fut>(script: F) -> (String, JoinHandle<Handshake>)
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let captured = Arc::new(Mutex::new(Handshake::default()));
        let record = captured.clone();
        let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
            let mut seen = record.lock().unwrap();
            seen.uri = req.uri().to_string();
            seen.authorization = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            Ok(resp)
        })
        .await
        .unwrap();
        script(ws).await;
        let seen = captured.lock().unwrap().clone();
        seen
    });
    (format!("ws://{}", addr), handle)
}

/// Server answering every handshake with an HTTP error status.
pub(crate) async fn rejecting_server(status: u16) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = accept_hdr_async(stream, move |_: &Request, _: Response| {
                    let denied: ErrorResponse = Response::builder()
                        .status(status)
                        .body(Some("denied".to_string()))
                        .unwrap();
                    Err(denied)
                })
                .await;
            });
        }
    });
    format!("ws://{}", addr)
}

/// TCP echo target; returns its port.
pub(crate) async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

/// A port with nothing listening on it.
pub(crate) async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

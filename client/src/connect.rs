//! Session establishment: relay URL construction, authorization header and
//! WebSocket handshake.

use std::sync::Arc;

use kubetap_shared::protocol::TunnelRequest;
use kubetap_shared::{encode_query, Error, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::credentials::CredentialSource;

/// An open relay connection
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Longest handshake rejection body kept in errors
const MAX_BODY_PREVIEW: usize = 512;

/// Opens authenticated sessions against one relay.
///
/// Holds no per-session state; clones share the credential source and may be
/// used from any number of tasks at once.
#[derive(Clone)]
pub struct Establisher {
    base: Url,
    credentials: Arc<dyn CredentialSource>,
}

impl std::fmt::Debug for Establisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Establisher").field("base", &self.base.as_str()).finish()
    }
}

impl Establisher {
    /// Validate `base_url` and build an establisher. `http`/`https` URLs are
    /// accepted and mapped to `ws`/`wss`.
    pub fn new(base_url: &str, credentials: impl CredentialSource + 'static) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let mut base = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match base.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        if base.host_str().is_none() {
            return Err(invalid("missing host".into()));
        }
        if base.scheme() != scheme {
            base.set_scheme(scheme)
                .map_err(|_| invalid(format!("cannot use scheme '{}'", scheme)))?;
        }
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self {
            base,
            credentials: Arc::new(credentials),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Full relay URL for `path` with an already encoded query string.
    pub fn url_for(&self, path: &str, query: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            self.base.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query((!query.is_empty()).then_some(query));
        url
    }

    /// Perform the authenticated handshake. No retries.
    pub async fn open(&self, path: &str, query: &str) -> Result<WsStream> {
        let url = self.url_for(path, query);
        let credentials = self.credentials.credentials()?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let header = HeaderValue::from_str(&credentials.header_value())
            .map_err(|_| Error::Encoding("access token contains invalid header characters".into()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        debug!("Connecting to {}{}", self.base, path.trim_start_matches('/'));
        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| handshake_error(url.as_str(), e))?;
        debug!("Handshake complete ({})", response.status());
        Ok(stream)
    }

    /// Encode `request` and open a session on its relay path.
    pub async fn open_request<R: TunnelRequest>(&self, request: &R) -> Result<WsStream> {
        let query = encode_query(request)?;
        self.open(R::PATH, &query).await
    }
}

fn handshake_error(url: &str, err: WsError) -> Error {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Error::Unauthorized {
                    status: status.as_u16(),
                };
            }
            let mut body = response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .unwrap_or_default();
            truncate(&mut body, MAX_BODY_PREVIEW);
            Error::HandshakeRejected {
                status: status.as_u16(),
                body,
            }
        }
        WsError::Url(e) => Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        },
        WsError::Io(e) => Error::Network(e),
        other => Error::Connection(other.to_string()),
    }
}

/// Map an error raised on an established session.
pub(crate) fn transport_error(err: WsError) -> Error {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ClosedBeforeResponse,
        WsError::Io(e) => Error::Network(e),
        other => Error::Connection(other.to_string()),
    }
}

pub(crate) fn truncate(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push('…');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credentials, StaticCredentials};
    use crate::testing;
    use futures_util::StreamExt;

    fn establisher(base: &str) -> Result<Establisher> {
        Establisher::new(base, StaticCredentials::new(Credentials::bearer("t")))
    }

    #[test]
    fn test_url_for_appends_path_and_query() {
        let est = establisher("wss://relay.example.com").unwrap();
        let url = est.url_for("/cluster/status", "organization=o&cluster=c");
        assert_eq!(url.as_str(), "wss://relay.example.com/cluster/status?organization=o&cluster=c");
    }

    #[test]
    fn test_url_for_keeps_base_path_and_brackets() {
        let est = establisher("https://relay.example.com/api/").unwrap();
        let url = est.url_for("/shell/exec", "command[0]=sh&command[1]=-c");
        assert_eq!(
            url.as_str(),
            "wss://relay.example.com/api/shell/exec?command[0]=sh&command[1]=-c"
        );
    }

    #[test]
    fn test_malformed_base_url() {
        assert!(matches!(establisher("not a url"), Err(Error::InvalidUrl { .. })));
        assert!(matches!(establisher("ftp://relay"), Err(Error::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_sends_authorization_header() {
        let (base, server) = testing::scripted_server(|mut ws| async move {
            let _ = ws.close(None).await;
            while ws.next().await.is_some() {}
        })
        .await;
        let est = Establisher::new(&base, StaticCredentials::new(Credentials::new("Token", "abc123")))
            .unwrap();
        let ws = est.open("/cluster/nodes", "organization=o&cluster=c").await.unwrap();
        drop(ws);

        let seen = server.await.unwrap();
        assert_eq!(seen.authorization.as_deref(), Some("Token abc123"));
        assert_eq!(seen.uri, "/cluster/nodes?organization=o&cluster=c");
    }

    #[tokio::test]
    async fn test_unauthorized_is_distinguishable() {
        let base = testing::rejecting_server(401).await;
        let err = establisher(&base).unwrap().open("/cluster/status", "").await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized { status: 401 }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_other_rejection_keeps_status_and_body() {
        let base = testing::rejecting_server(502).await;
        let err = establisher(&base).unwrap().open("/port-forward", "port=1").await.unwrap_err();
        match err {
            Error::HandshakeRejected { status, body } => {
                assert_eq!(status, 502);
                // The body is only kept when it arrived with the headers.
                assert!(body.is_empty() || body == "denied", "{}", body);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        let port = testing::closed_port().await;
        let err = establisher(&format!("ws://127.0.0.1:{}", port))
            .unwrap()
            .open("/cluster/status", "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_expired_token_against_relay() {
        let base = testing::spawn_relay().await;
        let err = testing::establisher_with_token(&base, "expired")
            .open("/cluster/status", "organization=o&cluster=c")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }), "{:?}", err);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let mut text = "ééééé".to_string();
        truncate(&mut text, 3);
        assert_eq!(text, "é…");
    }
}

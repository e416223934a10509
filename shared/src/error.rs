//! Error types for kubetap.
//!
//! Variants are grouped into classes (see [`ErrorClass`]) so the CLI can decide
//! how to report a failure without matching every variant.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request values or settings, detected before any I/O.
    Configuration,
    /// DNS, TCP, TLS or handshake failure.
    Connection,
    /// The relay answered with something the protocol does not allow.
    Protocol,
    /// A relayed stream or local listener failed.
    Relay,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Encoding(String),

    #[error("Invalid relay URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid port mapping '{0}' (expected LOCAL:REMOTE or PORT)")]
    InvalidPortMapping(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Relay rejected the access token (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("Relay refused the session (HTTP {status}){}", format_body(.body))]
    HandshakeRejected { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[source] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(#[source] serde_json::Error),

    #[error("Protocol violation: expected a text frame, got {kind} frame ({len} bytes): {preview}")]
    ProtocolViolation {
        kind: &'static str,
        len: usize,
        preview: String,
    },

    #[error("Relay closed the session before answering")]
    ClosedBeforeResponse,

    #[error("Invalid frame: {0}")]
    Frame(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("None of the requested ports could be bound")]
    NoPortsBound,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Encoding(_)
            | Error::InvalidUrl { .. }
            | Error::InvalidPortMapping(_)
            | Error::Config(_) => ErrorClass::Configuration,
            Error::Unauthorized { .. }
            | Error::HandshakeRejected { .. }
            | Error::Network(_)
            | Error::Connection(_) => ErrorClass::Connection,
            Error::MalformedResponse(_)
            | Error::ProtocolViolation { .. }
            | Error::ClosedBeforeResponse
            | Error::Frame(_) => ErrorClass::Protocol,
            Error::Io(_) | Error::Bind { .. } | Error::NoPortsBound => ErrorClass::Relay,
        }
    }

    /// Short advice printed after the error message, if any applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::Unauthorized { .. } => Some("please re-authenticate and try again"),
            Error::Network(_) => Some("network unreachable, check the relay URL and your connection"),
            Error::InvalidUrl { .. } => Some("set a ws:// or wss:// relay URL with --relay or in kubetap.yml"),
            Error::Bind { .. } => Some("the local port is already in use, pick another one"),
            _ => None,
        }
    }
}

fn format_body(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(": {}", body)
    }
}

//! kubetap client
//!
//! Reaches into a live Kubernetes cluster through a platform relay over typed
//! WebSocket sessions. Requests travel in the handshake URL; the relay answers
//! either with a single JSON document (queries) or turns the socket into a
//! duplex byte relay (shells and port forwards).

pub mod config;
pub mod connect;
pub mod credentials;
pub mod forward;
pub mod proxy;
pub mod query;
pub mod shell;
pub mod signal;
pub mod terminal;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use connect::Establisher;
pub use query::QueryClient;
pub use tunnel::{SessionEnd, SessionState, TunnelController, TunnelOptions};

//! Tunnel session controller
//!
//! Opens long-lived duplex sessions against the relay (interactive shells and
//! port forwards) and keeps the shared bookkeeping of forwarded ports.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kubetap_shared::protocol::{PortForwardRequest, ShellTarget, TerminalSize};
use kubetap_shared::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connect::Establisher;
use crate::forward::{PortForwardSession, PortMapping, RelayChannelOpener};
use crate::shell::ShellSession;

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(2000);

/// Lifecycle of a tunnel session. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The relay closed the session
    RemoteClosed,
    /// Local input reached EOF and the relay then closed
    LocalEof,
    /// Interrupted by the user
    Cancelled,
}

/// Runtime knobs for tunnel sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Address local port-forward listeners bind to
    pub bind_address: IpAddr,
    /// Upper bound on waiting for tasks after cancellation
    pub shutdown_grace: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Per local port counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingStats {
    pub remote_port: u16,
    /// Connections currently relaying
    pub active: usize,
    /// Connections accepted since the binding started
    pub accepted: u64,
}

/// Bookkeeping of the active port bindings of one session, keyed by local
/// port. Shared by every accept loop and connection task.
#[derive(Debug, Clone, Default)]
pub struct BindingRegistry {
    inner: Arc<Mutex<BTreeMap<u16, BindingStats>>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u16, BindingStats>> {
        // Counters stay meaningful even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_binding(&self, local_port: u16, remote_port: u16) {
        self.lock().insert(
            local_port,
            BindingStats {
                remote_port,
                ..BindingStats::default()
            },
        );
    }

    pub fn deregister_binding(&self, local_port: u16) {
        self.lock().remove(&local_port);
    }

    /// Count an accepted connection on `local_port` until the guard drops.
    pub fn track_connection(&self, local_port: u16) -> ConnectionGuard {
        if let Some(stats) = self.lock().get_mut(&local_port) {
            stats.active += 1;
            stats.accepted += 1;
        }
        ConnectionGuard {
            registry: self.clone(),
            local_port,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<u16, BindingStats> {
        self.lock().clone()
    }

    pub fn active_connections(&self) -> usize {
        self.lock().values().map(|s| s.active).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Keeps one connection counted in the registry
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: BindingRegistry,
    local_port: u16,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(stats) = self.registry.lock().get_mut(&self.local_port) {
            stats.active = stats.active.saturating_sub(1);
        }
    }
}

/// Opens tunnel sessions through one relay
#[derive(Debug, Clone)]
pub struct TunnelController {
    establisher: Establisher,
    options: TunnelOptions,
}

impl TunnelController {
    pub fn new(establisher: Establisher, options: TunnelOptions) -> Self {
        Self {
            establisher,
            options,
        }
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.options
    }

    /// Open an interactive shell. The initial terminal size, when known, is
    /// sent in the handshake so the remote pty starts at the right size.
    pub async fn open_shell<R: ShellTarget>(
        &self,
        mut request: R,
        size: Option<TerminalSize>,
    ) -> Result<ShellSession> {
        if let Some(size) = size {
            request.set_terminal_size(size);
        }
        let ws = self.establisher.open_request(&request).await?;
        info!("Shell session established ({})", R::PATH);
        Ok(ShellSession::new(ws, size, self.options.shutdown_grace))
    }

    /// Bind every mapping and start forwarding. Fails only when no mapping
    /// could be bound.
    pub async fn open_port_forward(
        &self,
        request: PortForwardRequest,
        mappings: &[PortMapping],
        cancel: &CancellationToken,
    ) -> Result<PortForwardSession> {
        let opener = RelayChannelOpener::new(self.establisher.clone(), request);
        PortForwardSession::open(opener, mappings, &self.options, cancel).await
    }
}

//! Local port multiplexer
//!
//! One TCP listener per `local:remote` mapping. Every accepted connection gets
//! its own relay channel to the remote port and an independent byte pump.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use kubetap_shared::protocol::PortForwardRequest;
use kubetap_shared::{Error, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connect::{Establisher, WsStream};
use crate::proxy;
use crate::tunnel::{BindingRegistry, ConnectionGuard, SessionEnd, SessionState, TunnelOptions};

/// Extra time granted to binding tasks on top of their own drain window
const JOIN_SLACK: Duration = Duration::from_millis(250);

/// A `local:remote` port pair. Local port 0 binds an ephemeral port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub local: u16,
    pub remote: u16,
}

impl PortMapping {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
}

impl FromStr for PortMapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPortMapping(s.to_string());
        let parse = |part: &str| part.trim().parse::<u16>().map_err(|_| invalid());

        let mapping = match s.split_once(':') {
            Some((local, remote)) => PortMapping::new(parse(local)?, parse(remote)?),
            None => {
                let port = parse(s)?;
                PortMapping::new(port, port)
            }
        };
        if mapping.remote == 0 {
            return Err(invalid());
        }
        Ok(mapping)
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// Opens one forwarding channel to a remote port.
pub trait ChannelOpener: Clone + Send + Sync + 'static {
    fn open_channel(&self, remote_port: u16) -> impl Future<Output = Result<WsStream>> + Send;
}

/// Opens channels as separate `/port-forward` sessions on the relay.
#[derive(Debug, Clone)]
pub struct RelayChannelOpener {
    establisher: Establisher,
    request: PortForwardRequest,
}

impl RelayChannelOpener {
    pub fn new(establisher: Establisher, request: PortForwardRequest) -> Self {
        Self {
            establisher,
            request,
        }
    }
}

impl ChannelOpener for RelayChannelOpener {
    fn open_channel(&self, remote_port: u16) -> impl Future<Output = Result<WsStream>> + Send {
        let establisher = self.establisher.clone();
        let request = self.request.for_port(remote_port);
        async move { establisher.open_request(&request).await }
    }
}

/// One bound local listener
#[derive(Debug)]
pub struct PortBinding {
    mapping: PortMapping,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl PortBinding {
    /// Bind the local side of `mapping`. An occupied port fails right away.
    pub async fn bind(mapping: PortMapping, bind_address: IpAddr) -> Result<Self> {
        let listener = TcpListener::bind((bind_address, mapping.local))
            .await
            .map_err(|source| Error::Bind {
                port: mapping.local,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            mapping,
            listener,
            local_addr,
        })
    }

    pub fn mapping(&self) -> PortMapping {
        self.mapping
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `cancel` fires, then close the listener and
    /// give in-flight connections at most `grace` to finish.
    pub async fn serve<O: ChannelOpener>(
        self,
        opener: O,
        registry: BindingRegistry,
        cancel: CancellationToken,
        grace: Duration,
    ) {
        let port = self.local_addr.port();
        let mapping = self.mapping;
        registry.register_binding(port, mapping.remote);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted {} on port {}", peer, port);
                        let guard = registry.track_connection(port);
                        connections.spawn(forward_connection(
                            stream,
                            peer,
                            mapping,
                            opener.clone(),
                            cancel.clone(),
                            guard,
                        ));
                    }
                    Err(e) => warn!("Accept failed on port {}: {}", port, e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(self.listener);
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Aborting {} connection(s) on port {} after {:?}",
                connections.len(),
                port,
                grace
            );
            connections.abort_all();
        }
        registry.deregister_binding(port);
        info!("Stopped forwarding port {}", port);
    }
}

async fn forward_connection<O: ChannelOpener>(
    stream: TcpStream,
    peer: SocketAddr,
    mapping: PortMapping,
    opener: O,
    cancel: CancellationToken,
    _guard: ConnectionGuard,
) {
    let channel = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = opener.open_channel(mapping.remote) => match opened {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Forwarding {} for {} failed: {}", mapping, peer, e);
                return;
            }
        },
    };
    match proxy::pump(stream, channel, cancel).await {
        Ok(stats) => debug!(
            "Connection {} on {} closed ({} bytes sent, {} received)",
            peer, mapping, stats.sent, stats.received
        ),
        Err(e) => warn!("Connection {} on {} failed: {}", peer, mapping, e),
    }
}

/// A bound local port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPort {
    pub mapping: PortMapping,
    pub local_addr: SocketAddr,
}

/// A mapping whose local port could not be bound
#[derive(Debug)]
pub struct BindFailure {
    pub mapping: PortMapping,
    pub error: Error,
}

/// Running port-forward session supervising one task per binding
#[derive(Debug)]
pub struct PortForwardSession {
    bound: Vec<BoundPort>,
    failures: Vec<BindFailure>,
    registry: BindingRegistry,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    state: SessionState,
    grace: Duration,
}

impl PortForwardSession {
    pub(crate) async fn open<O: ChannelOpener>(
        opener: O,
        mappings: &[PortMapping],
        options: &TunnelOptions,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let mut bindings = Vec::new();
        let mut failures = Vec::new();
        for &mapping in mappings {
            match PortBinding::bind(mapping, options.bind_address).await {
                Ok(binding) => bindings.push(binding),
                Err(error) => {
                    warn!("Skipping {}: {}", mapping, error);
                    failures.push(BindFailure { mapping, error });
                }
            }
        }
        if bindings.is_empty() {
            return Err(match failures.len() {
                1 => failures.remove(0).error,
                _ => Error::NoPortsBound,
            });
        }

        let cancel = parent.child_token();
        let registry = BindingRegistry::new();
        let mut tasks = JoinSet::new();
        let mut bound = Vec::with_capacity(bindings.len());
        for binding in bindings {
            info!(
                "Forwarding {} -> remote port {}",
                binding.local_addr(),
                binding.mapping().remote
            );
            bound.push(BoundPort {
                mapping: binding.mapping(),
                local_addr: binding.local_addr(),
            });
            tasks.spawn(binding.serve(
                opener.clone(),
                registry.clone(),
                cancel.clone(),
                options.shutdown_grace,
            ));
        }

        Ok(Self {
            bound,
            failures,
            registry,
            tasks,
            cancel,
            state: SessionState::Active,
            grace: options.shutdown_grace,
        })
    }

    pub fn bound(&self) -> &[BoundPort] {
        &self.bound
    }

    pub fn failures(&self) -> &[BindFailure] {
        &self.failures
    }

    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Stop every binding; `wait` then returns.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run until cancelled, then close every listener and connection within
    /// the shutdown window.
    pub async fn wait(&mut self) -> SessionEnd {
        if self.state >= SessionState::Closing {
            return SessionEnd::Cancelled;
        }
        let tasks = &mut self.tasks;
        let end = tokio::select! {
            _ = self.cancel.cancelled() => SessionEnd::Cancelled,
            _ = async { while tasks.join_next().await.is_some() {} } => SessionEnd::RemoteClosed,
        };

        self.state = SessionState::Closing;
        self.cancel.cancel();
        let tasks = &mut self.tasks;
        let joined = tokio::time::timeout(self.grace + JOIN_SLACK, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            self.tasks.abort_all();
        }
        self.state = SessionState::Closed;
        info!("Port forwarding stopped");
        end
    }
}

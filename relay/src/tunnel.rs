//! Active session tracking for the loopback relay

use dashmap::DashMap;
use kubetap_shared::protocol::{SessionKind, TerminalSize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Unique session identifier
pub type SessionId = u64;

/// Represents an open duplex session
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub kind: SessionKind,
    /// Human-readable target (service, cluster or port)
    pub target: String,
    pub created_at: std::time::Instant,
    /// Last terminal size announced by the client (shell only)
    pub terminal: Option<TerminalSize>,
}

/// Table of open sessions, shared by all handlers
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<DashMap<SessionId, ActiveSession>>,
    next_id: Arc<AtomicU64>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; it is removed when the guard drops.
    pub fn open(&self, kind: SessionKind, target: String) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Session {} opened: {} {}", id, kind, target);
        self.sessions.insert(
            id,
            ActiveSession {
                kind,
                target,
                created_at: std::time::Instant::now(),
                terminal: None,
            },
        );
        SessionGuard {
            id,
            table: self.clone(),
        }
    }

    pub fn record_resize(&self, id: SessionId, size: TerminalSize) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.terminal = Some(size);
        }
    }

    pub fn get(&self, id: SessionId) -> Option<ActiveSession> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of open sessions of one kind
    pub fn count(&self, kind: SessionKind) -> usize {
        self.sessions.iter().filter(|s| s.kind == kind).count()
    }
}

/// Removes its session from the table on drop
pub struct SessionGuard {
    id: SessionId,
    table: SessionTable,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((_, session)) = self.table.sessions.remove(&self.id) {
            info!(
                "Session {} closed after {:?}: {} {}",
                self.id,
                session.created_at.elapsed(),
                session.kind,
                session.target
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removes_session() {
        let table = SessionTable::new();
        let guard = table.open(SessionKind::Shell, "svc".into());
        let other = table.open(SessionKind::PortForward, "5432".into());
        assert_eq!(table.len(), 2);
        assert_eq!(table.count(SessionKind::Shell), 1);
        assert_ne!(guard.id(), other.id());

        table.record_resize(guard.id(), TerminalSize::new(90, 20));
        assert_eq!(table.get(guard.id()).unwrap().terminal, Some(TerminalSize::new(90, 20)));

        drop(guard);
        assert_eq!(table.len(), 1);
        drop(other);
        assert!(table.is_empty());
    }
}

//! Local terminal: raw mode, size and resize notifications.

use std::io::IsTerminal;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use kubetap_shared::protocol::TerminalSize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Whether stdin and stdout are both attached to a terminal
pub fn is_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

/// Puts the terminal in raw mode for as long as it lives.
pub struct RawModeGuard(bool);

impl RawModeGuard {
    pub fn new(enable: bool) -> Self {
        if !enable {
            return Self(false);
        }
        match enable_raw_mode() {
            Ok(()) => Self(true),
            Err(e) => {
                warn!("Failed to enable raw mode: {}", e);
                Self(false)
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.0
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}

/// Current terminal size, if stdout is a terminal
pub fn current_size() -> Option<TerminalSize> {
    match crossterm::terminal::size() {
        Ok((width, height)) if width > 0 && height > 0 => Some(TerminalSize::new(width, height)),
        Ok(_) => None,
        Err(e) => {
            debug!("Terminal size unavailable: {}", e);
            None
        }
    }
}

/// Stream of terminal sizes, one per SIGWINCH, until `cancel` fires.
pub fn watch_resizes(cancel: CancellationToken) -> mpsc::Receiver<TerminalSize> {
    let (tx, rx) = mpsc::channel(8);

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGWINCH handler: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = sigwinch.recv() => {
                    if received.is_none() {
                        break;
                    }
                    let Some(size) = current_size() else { continue };
                    if tx.send(size).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    #[cfg(not(unix))]
    drop((tx, cancel));

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_guard_is_noop() {
        let guard = RawModeGuard::new(false);
        assert!(!guard.is_enabled());
    }

    #[tokio::test]
    async fn test_resize_watch_ends_on_cancel() {
        let cancel = CancellationToken::new();
        let mut sizes = watch_resizes(cancel.clone());
        cancel.cancel();
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), sizes.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}

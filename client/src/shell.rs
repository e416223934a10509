//! Interactive shell sessions over channel-tagged binary frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use kubetap_shared::frame::{RemoteStatus, ShellFrame, StreamTag};
use kubetap_shared::protocol::TerminalSize;
use kubetap_shared::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connect::{transport_error, WsStream};
use crate::tunnel::{SessionEnd, SessionState};

/// Exit code reported when the session is interrupted before the remote
/// command reported one
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

const STDIN_BUF_SIZE: usize = 4096;

/// Local byte streams wired to the remote process
pub struct ShellIo<I, O, E> {
    pub stdin: I,
    pub stdout: O,
    pub stderr: E,
}

/// How a shell session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutcome {
    pub end: SessionEnd,
    pub exit_code: i32,
    pub status: Option<RemoteStatus>,
}

impl ShellOutcome {
    fn new(end: SessionEnd, status: Option<RemoteStatus>) -> Self {
        let exit_code = match (&status, end) {
            (Some(status), _) => status.exit_code(),
            (None, SessionEnd::Cancelled) => INTERRUPTED_EXIT_CODE,
            (None, _) => 0,
        };
        Self {
            end,
            exit_code,
            status,
        }
    }
}

enum Inbound {
    Continue,
    Closed,
}

/// An established shell session
pub struct ShellSession {
    ws: WsStream,
    state: SessionState,
    size: Option<TerminalSize>,
    grace: Duration,
}

impl ShellSession {
    pub(crate) fn new(ws: WsStream, size: Option<TerminalSize>, grace: Duration) -> Self {
        Self {
            ws,
            state: SessionState::Active,
            size,
            grace,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last terminal size sent to the relay
    pub fn terminal_size(&self) -> Option<TerminalSize> {
        self.size
    }

    /// Relay stdin, stdout, stderr and resize events until the session ends.
    ///
    /// Local stdin EOF closes the remote stdin and keeps reading output until
    /// the relay closes. Cancellation closes the session and waits at most the
    /// shutdown grace period for the relay to acknowledge.
    pub async fn run<I, O, E>(
        &mut self,
        io: ShellIo<I, O, E>,
        resizes: mpsc::Receiver<TerminalSize>,
        cancel: &CancellationToken,
    ) -> Result<ShellOutcome>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let ShellIo {
            stdin,
            mut stdout,
            mut stderr,
        } = io;
        let (stdin_tx, stdin_rx) = mpsc::channel(16);
        let stdin_pump = tokio::spawn(pump_stdin(stdin, stdin_tx));

        let result = self
            .relay(stdin_rx, resizes, &mut stdout, &mut stderr, cancel)
            .await;
        stdin_pump.abort();

        if self.state < SessionState::Closing {
            self.state = SessionState::Closing;
        }
        match tokio::time::timeout(self.grace, self.ws.close(None)).await {
            Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing shell session failed: {}", e),
            Err(_) => debug!("Relay did not take the close frame within {:?}", self.grace),
        }
        self.state = SessionState::Closed;

        let outcome = result?;
        info!(
            "Shell session ended ({:?}, exit code {})",
            outcome.end, outcome.exit_code
        );
        Ok(outcome)
    }

    async fn relay<O, E>(
        &mut self,
        mut stdin_rx: mpsc::Receiver<Vec<u8>>,
        mut resizes: mpsc::Receiver<TerminalSize>,
        stdout: &mut O,
        stderr: &mut E,
        cancel: &CancellationToken,
    ) -> Result<ShellOutcome>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let mut status = None;
        let mut stdin_open = true;
        let mut resizes_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Interrupted, closing shell session");
                    self.state = SessionState::Closing;
                    if let Err(e) = self.ws.send(Message::Close(None)).await {
                        debug!("Sending close failed: {}", e);
                    }
                    let ws = &mut self.ws;
                    let drained = tokio::time::timeout(self.grace, async {
                        while let Ok(Inbound::Continue) =
                            on_message(ws.next().await, stdout, stderr, &mut status).await
                        {}
                    })
                    .await;
                    if drained.is_err() {
                        debug!("Relay did not close within {:?}", self.grace);
                    }
                    return Ok(ShellOutcome::new(SessionEnd::Cancelled, status));
                }
                chunk = stdin_rx.recv(), if stdin_open => match chunk {
                    Some(data) => self.send_frame(ShellFrame::Stdin(data)).await?,
                    None => {
                        debug!("Local stdin closed");
                        stdin_open = false;
                        self.state = SessionState::Closing;
                        self.send_frame(ShellFrame::CloseStream(StreamTag::Stdin)).await?;
                    }
                },
                size = resizes.recv(), if resizes_open => match size {
                    Some(size) if Some(size) != self.size => {
                        debug!("Terminal resized to {}x{}", size.width, size.height);
                        self.size = Some(size);
                        self.send_frame(ShellFrame::Resize(size)).await?;
                    }
                    Some(_) => {}
                    None => resizes_open = false,
                },
                msg = self.ws.next() => {
                    if let Inbound::Closed = on_message(msg, stdout, stderr, &mut status).await? {
                        let end = if stdin_open {
                            SessionEnd::RemoteClosed
                        } else {
                            SessionEnd::LocalEof
                        };
                        self.state = SessionState::Closing;
                        return Ok(ShellOutcome::new(end, status));
                    }
                }
            }
        }
    }

    async fn send_frame(&mut self, frame: ShellFrame) -> Result<()> {
        let data = frame.encode()?;
        self.ws
            .send(Message::Binary(data))
            .await
            .map_err(transport_error)
    }
}

async fn on_message<O, E>(
    msg: Option<std::result::Result<Message, WsError>>,
    stdout: &mut O,
    stderr: &mut E,
    status: &mut Option<RemoteStatus>,
) -> Result<Inbound>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let data = match msg {
        Some(Ok(Message::Binary(data))) => data,
        Some(Ok(Message::Close(_))) | None => return Ok(Inbound::Closed),
        Some(Ok(_)) => return Ok(Inbound::Continue),
        Some(Err(e)) => return Err(transport_error(e)),
    };
    match ShellFrame::decode(&data)? {
        ShellFrame::Stdout(bytes) => {
            stdout.write_all(&bytes).await?;
            stdout.flush().await?;
        }
        ShellFrame::Stderr(bytes) => {
            stderr.write_all(&bytes).await?;
            stderr.flush().await?;
        }
        ShellFrame::Status(remote) => {
            if !remote.is_success() {
                debug!("Remote command failed: {:?}", remote.message);
            }
            *status = Some(remote);
        }
        ShellFrame::CloseStream(stream) => debug!("Relay closed {:?}", stream),
        other => warn!("Unexpected {:?} frame from relay", other.tag()),
    }
    Ok(Inbound::Continue)
}

async fn pump_stdin<I: AsyncRead + Unpin>(mut stdin: I, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; STDIN_BUF_SIZE];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Reading stdin failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::tunnel::{TunnelController, TunnelOptions};
    use kubetap_shared::protocol::ShellRequest;
    use tokio::net::TcpStream;
    use tokio_tungstenite::WebSocketStream;

    fn request(command: &[&str]) -> ShellRequest {
        ShellRequest {
            organization: "org".into(),
            project: "proj".into(),
            environment: "env".into(),
            service: "web".into(),
            pod_name: None,
            container_name: None,
            command: command.iter().map(|c| c.to_string()).collect(),
            tty_width: None,
            tty_height: None,
        }
    }

    fn controller(base: &str) -> TunnelController {
        TunnelController::new(
            testing::establisher(base),
            TunnelOptions {
                shutdown_grace: Duration::from_millis(500),
                ..TunnelOptions::default()
            },
        )
    }

    async fn send(ws: &mut WebSocketStream<TcpStream>, frame: ShellFrame) {
        ws.send(Message::Binary(frame.encode().unwrap())).await.unwrap();
    }

    async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Option<ShellFrame> {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                return Some(ShellFrame::decode(&data).unwrap());
            }
        }
        None
    }

    async fn finish(mut ws: WebSocketStream<TcpStream>) {
        let _ = ws.close(None).await;
        while ws.next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_output_is_demultiplexed_and_exit_code_kept() {
        let (base, server) = testing::scripted_server(|mut ws| async move {
            send(&mut ws, ShellFrame::Stdout(b"hello\n".to_vec())).await;
            send(&mut ws, ShellFrame::Stderr(b"oops\n".to_vec())).await;
            send(&mut ws, ShellFrame::Status(RemoteStatus::exited(3))).await;
            finish(ws).await;
        })
        .await;

        let mut session = controller(&base).open_shell(request(&[]), None).await.unwrap();
        let (_keep_open, stdin) = tokio::io::duplex(64);
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let (_resize_tx, resizes) = mpsc::channel(1);
        let outcome = session
            .run(
                ShellIo {
                    stdin,
                    stdout: &mut out,
                    stderr: &mut err,
                },
                resizes,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.end, SessionEnd::RemoteClosed);
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(out, b"hello\n");
        assert_eq!(err, b"oops\n");
        assert_eq!(session.state(), SessionState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_frames_carry_new_size() {
        let (base, server) = testing::scripted_server(|mut ws| async move {
            match next_frame(&mut ws).await {
                Some(ShellFrame::Resize(size)) => assert_eq!(size, TerminalSize::new(100, 30)),
                other => panic!("expected resize, got {:?}", other),
            }
            finish(ws).await;
        })
        .await;

        let mut session = controller(&base)
            .open_shell(request(&["bash"]), Some(TerminalSize::new(80, 24)))
            .await
            .unwrap();
        assert_eq!(session.terminal_size(), Some(TerminalSize::new(80, 24)));

        let (resize_tx, resizes) = mpsc::channel(4);
        resize_tx.send(TerminalSize::new(100, 30)).await.unwrap();
        let (_keep_open, stdin) = tokio::io::duplex(64);
        let outcome = session
            .run(
                ShellIo {
                    stdin,
                    stdout: tokio::io::sink(),
                    stderr: tokio::io::sink(),
                },
                resizes,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.end, SessionEnd::RemoteClosed);
        assert_eq!(session.terminal_size(), Some(TerminalSize::new(100, 30)));
        let seen = server.await.unwrap();
        assert!(seen.uri.contains("command[0]=bash"), "{}", seen.uri);
        assert!(seen.uri.contains("tty_width=80&tty_height=24"), "{}", seen.uri);
    }

    #[tokio::test]
    async fn test_stdin_eof_closes_remote_stdin() {
        let (base, server) = testing::scripted_server(|mut ws| async move {
            let mut input = Vec::new();
            loop {
                match next_frame(&mut ws).await {
                    Some(ShellFrame::Stdin(bytes)) => input.extend_from_slice(&bytes),
                    Some(ShellFrame::CloseStream(StreamTag::Stdin)) => break,
                    other => panic!("unexpected frame {:?}", other),
                }
            }
            assert_eq!(input, b"ls\n");
            send(&mut ws, ShellFrame::Stdout(b"file\n".to_vec())).await;
            send(&mut ws, ShellFrame::Status(RemoteStatus::success())).await;
            finish(ws).await;
        })
        .await;

        let mut session = controller(&base).open_shell(request(&[]), None).await.unwrap();
        let mut out = Vec::new();
        let (_resize_tx, resizes) = mpsc::channel(1);
        let outcome = session
            .run(
                ShellIo {
                    stdin: &b"ls\n"[..],
                    stdout: &mut out,
                    stderr: tokio::io::sink(),
                },
                resizes,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.end, SessionEnd::LocalEof);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(out, b"file\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_ends_session_within_grace() {
        let (base, server) = testing::scripted_server(|mut ws| async move {
            send(&mut ws, ShellFrame::Stdout(b"tick\n".to_vec())).await;
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut session = controller(&base).open_shell(request(&[]), None).await.unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let (_keep_open, stdin) = tokio::io::duplex(64);
        let (_resize_tx, resizes) = mpsc::channel(1);
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            session.run(
                ShellIo {
                    stdin,
                    stdout: tokio::io::sink(),
                    stderr: tokio::io::sink(),
                },
                resizes,
                &cancel,
            ),
        )
        .await
        .expect("session did not stop")
        .unwrap();

        assert_eq!(outcome.end, SessionEnd::Cancelled);
        assert_eq!(outcome.exit_code, INTERRUPTED_EXIT_CODE);
        assert_eq!(session.state(), SessionState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_against_relay() {
        let base = testing::spawn_relay().await;
        let mut session = controller(&base)
            .open_shell(request(&["sh", "-c", "echo out; echo err >&2; exit 4"]), None)
            .await
            .unwrap();

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let (_resize_tx, resizes) = mpsc::channel(1);
        let outcome = session
            .run(
                ShellIo {
                    stdin: tokio::io::empty(),
                    stdout: &mut out,
                    stderr: &mut err,
                },
                resizes,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 4);
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
    }
}

//! Shell endpoints: run a local process and relay its stdio as tagged frames.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use kubetap_shared::frame::{RemoteStatus, ShellFrame, StreamTag};
use kubetap_shared::protocol::{SessionKind, TerminalSize};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::authorize;
use crate::tunnel::SessionTable;
use crate::RelayState;

const DEFAULT_SHELL: &str = "sh";

/// Parameters of a shell request, parsed from raw query pairs so that
/// indexed `command[N]` keys are honoured.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ShellParams {
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub terminal: Option<TerminalSize>,
    pub target: String,
}

pub fn parse_shell_params(pairs: &[(String, String)]) -> ShellParams {
    let mut params = ShellParams::default();
    let mut indexed: Vec<(usize, String)> = Vec::new();
    let (mut width, mut height) = (None, None);

    for (key, value) in pairs {
        if let Some(index) = key
            .strip_prefix("command[")
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|n| n.parse::<usize>().ok())
        {
            indexed.push((index, value.clone()));
            continue;
        }
        match key.as_str() {
            "tty_width" => width = value.parse::<u16>().ok(),
            "tty_height" => height = value.parse::<u16>().ok(),
            "node_selector" => params
                .env
                .push(("KUBETAP_NODE_SELECTOR".to_string(), value.clone())),
            "privilege" => params
                .env
                .push(("KUBETAP_PRIVILEGE".to_string(), value.clone())),
            "service" | "cluster" => params.target = value.clone(),
            _ => {}
        }
    }

    indexed.sort_by_key(|(index, _)| *index);
    params.command = indexed.into_iter().map(|(_, v)| v).collect();
    if let (Some(width), Some(height)) = (width, height) {
        params.terminal = Some(TerminalSize::new(width, height));
    }
    params
}

pub(crate) async fn shell(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = authorize(&headers, &state.token) {
        return resp;
    }
    let params = parse_shell_params(&pairs);
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| run_shell(socket, params, sessions))
}

async fn run_shell(socket: WebSocket, params: ShellParams, sessions: SessionTable) {
    let guard = sessions.open(SessionKind::Shell, params.target.clone());
    if let Some(size) = params.terminal {
        sessions.record_resize(guard.id(), size);
    }
    let (mut sink, mut stream) = socket.split();

    let argv = if params.command.is_empty() {
        vec![DEFAULT_SHELL.to_string()]
    } else {
        params.command.clone()
    };
    info!("Spawning {:?}", argv);

    let spawned = Command::new(&argv[0])
        .args(&argv[1..])
        .envs(params.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to spawn {:?}: {}", argv, e);
            let status = RemoteStatus::failure(format!("failed to start {}: {}", argv[0], e));
            if let Ok(frame) = ShellFrame::Status(status).encode() {
                let _ = sink.send(Message::Binary(frame)).await;
            }
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let (frame_tx, mut frame_rx) = mpsc::channel::<ShellFrame>(64);
    if let Some(out) = child.stdout.take() {
        tokio::spawn(pipe_output(out, StreamTag::Stdout, frame_tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(pipe_output(err, StreamTag::Stderr, frame_tx.clone()));
    }
    drop(frame_tx);
    let mut stdin = child.stdin.take().map(|input| {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(feed_input(input, rx));
        tx
    });

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(data) = frame.encode() else { continue };
                if sink.send(Message::Binary(data)).await.is_err() {
                    let _ = child.start_kill();
                    return;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match ShellFrame::decode(&data) {
                        Ok(ShellFrame::Stdin(bytes)) => {
                            if let Some(tx) = stdin.as_ref() {
                                if tx.send(bytes).is_err() {
                                    stdin = None;
                                }
                            }
                        }
                        Ok(ShellFrame::CloseStream(StreamTag::Stdin)) => {
                            debug!("Client closed stdin");
                            stdin = None;
                        }
                        Ok(ShellFrame::Resize(size)) => {
                            debug!("Resize to {}x{}", size.width, size.height);
                            sessions.record_resize(guard.id(), size);
                        }
                        Ok(other) => debug!("Ignoring {:?} frame from client", other.tag()),
                        Err(e) => warn!("Bad frame from client: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        info!("Client left, killing process");
                        let _ = child.start_kill();
                        return;
                    }
                    _ => {}
                }
            }
        }
    }

    drop(stdin);
    let status = match child.wait().await {
        Ok(exit) => RemoteStatus::exited(exit.code().unwrap_or(1)),
        Err(e) => RemoteStatus::failure(e.to_string()),
    };
    info!("Process exited with code {}", status.exit_code());
    if let Ok(frame) = ShellFrame::Status(status).encode() {
        let _ = sink.send(Message::Binary(frame)).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Write client input to the process until the sender is dropped. Runs apart
/// from the session loop, which never waits on the process reading stdin.
async fn feed_input<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!("Process stdin closed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn pipe_output<R>(mut reader: R, tag: StreamTag, tx: mpsc::Sender<ShellFrame>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let data = buf[..n].to_vec();
        let frame = match tag {
            StreamTag::Stderr => ShellFrame::Stderr(data),
            _ => ShellFrame::Stdout(data),
        };
        if tx.send(frame).await.is_err() {
            break;
        }
    }
}

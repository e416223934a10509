//! Byte pump between one local TCP connection and one relay channel.

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use kubetap_shared::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connect::{transport_error, WsStream};

const READ_BUF_SIZE: usize = 16 * 1024;

/// Payload of the frame announcing that the local side stopped writing.
/// Data frames are never empty, so an empty one is unambiguous.
pub const HALF_CLOSE: &[u8] = &[];

/// Bytes moved by one pump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Local to remote
    pub sent: u64,
    /// Remote to local
    pub received: u64,
}

/// Copy bytes both ways until the remote side closes or `cancel` fires.
///
/// Local EOF is forwarded as an empty binary frame ([`HALF_CLOSE`]) so the
/// remote can still answer; a remote close shuts down the local write half.
/// The channel itself is closed once the pump ends.
pub async fn pump(local: TcpStream, channel: WsStream, cancel: CancellationToken) -> Result<PumpStats> {
    let (mut reader, mut writer) = local.into_split();
    let (mut sink, mut stream) = channel.split();
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let result = {
        let upstream = async {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sink.send(Message::Binary(buf[..n].to_vec()))
                    .await
                    .map_err(transport_error)?;
                sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            debug!("Local side closed its write half");
            sink.send(Message::Binary(HALF_CLOSE.to_vec()))
                .await
                .map_err(transport_error)?;
            Ok::<_, Error>(())
        };

        let downstream = async {
            while let Some(msg) = stream.next().await {
                match msg.map_err(transport_error)? {
                    Message::Binary(data) => {
                        writer.write_all(&data).await?;
                        received.fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            writer.shutdown().await?;
            Ok::<_, Error>(())
        };

        tokio::pin!(upstream, downstream);
        let ended = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            res = &mut downstream => res,
            res = &mut upstream => match res {
                Ok(()) => tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    res = &mut downstream => res,
                },
                Err(e) => Err(e),
            },
        };
        ended
    };

    if let Err(e) = sink.close().await {
        debug!("Channel close: {}", e);
    }

    let stats = PumpStats {
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
    };
    result.map(|()| stats)
}

//! Channel-tagged frames for shell sessions.
//!
//! Every binary WebSocket frame of a shell session starts with one byte naming
//! the stream it belongs to, followed by the payload:
//!
//! | tag | direction | payload |
//! |-----|-----------|---------|
//! | 0   | client → relay | stdin bytes |
//! | 1   | relay → client | stdout bytes |
//! | 2   | relay → client | stderr bytes |
//! | 3   | relay → client | exit status (JSON) |
//! | 4   | client → relay | terminal size (JSON) |
//! | 255 | both | close of the stream whose tag is the payload |

use serde::{Deserialize, Serialize};

use crate::protocol::TerminalSize;
use crate::{Error, Result};

/// Stream identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamTag {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    Status = 3,
    Resize = 4,
    Close = 255,
}

impl TryFrom<u8> for StreamTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StreamTag::Stdin),
            1 => Ok(StreamTag::Stdout),
            2 => Ok(StreamTag::Stderr),
            3 => Ok(StreamTag::Status),
            4 => Ok(StreamTag::Resize),
            255 => Ok(StreamTag::Close),
            other => Err(Error::Frame(format!("unknown stream tag {}", other))),
        }
    }
}

/// A decoded shell frame
#[derive(Debug, Clone, PartialEq)]
pub enum ShellFrame {
    Stdin(Vec<u8>),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Status(RemoteStatus),
    Resize(TerminalSize),
    CloseStream(StreamTag),
}

impl ShellFrame {
    pub fn tag(&self) -> StreamTag {
        match self {
            ShellFrame::Stdin(_) => StreamTag::Stdin,
            ShellFrame::Stdout(_) => StreamTag::Stdout,
            ShellFrame::Stderr(_) => StreamTag::Stderr,
            ShellFrame::Status(_) => StreamTag::Status,
            ShellFrame::Resize(_) => StreamTag::Resize,
            ShellFrame::CloseStream(_) => StreamTag::Close,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![self.tag() as u8];
        match self {
            ShellFrame::Stdin(data) | ShellFrame::Stdout(data) | ShellFrame::Stderr(data) => {
                out.extend_from_slice(data);
            }
            ShellFrame::Status(status) => {
                serde_json::to_writer(&mut out, status).map_err(|e| Error::Frame(e.to_string()))?;
            }
            ShellFrame::Resize(size) => {
                serde_json::to_writer(&mut out, size).map_err(|e| Error::Frame(e.to_string()))?;
            }
            ShellFrame::CloseStream(stream) => out.push(*stream as u8),
        }
        Ok(out)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&tag, payload) = frame
            .split_first()
            .ok_or_else(|| Error::Frame("empty frame".into()))?;
        match StreamTag::try_from(tag)? {
            StreamTag::Stdin => Ok(ShellFrame::Stdin(payload.to_vec())),
            StreamTag::Stdout => Ok(ShellFrame::Stdout(payload.to_vec())),
            StreamTag::Stderr => Ok(ShellFrame::Stderr(payload.to_vec())),
            StreamTag::Status => serde_json::from_slice(payload)
                .map(ShellFrame::Status)
                .map_err(|e| Error::Frame(format!("bad status payload: {}", e))),
            StreamTag::Resize => serde_json::from_slice(payload)
                .map(ShellFrame::Resize)
                .map_err(|e| Error::Frame(format!("bad resize payload: {}", e))),
            StreamTag::Close => {
                let stream = payload
                    .first()
                    .ok_or_else(|| Error::Frame("close frame without stream".into()))?;
                Ok(ShellFrame::CloseStream(StreamTag::try_from(*stream)?))
            }
        }
    }
}

/// Exit status reported by the relay on the status stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default)]
    pub causes: Vec<StatusCause>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCause {
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

const STATUS_SUCCESS: &str = "Success";
const STATUS_FAILURE: &str = "Failure";
const REASON_NON_ZERO_EXIT: &str = "NonZeroExitCode";
const CAUSE_EXIT_CODE: &str = "ExitCode";

impl RemoteStatus {
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            message: None,
            reason: None,
            details: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_FAILURE.to_string(),
            message: Some(message.into()),
            reason: None,
            details: None,
        }
    }

    /// Status for a process that exited with `code`.
    pub fn exited(code: i32) -> Self {
        if code == 0 {
            return Self::success();
        }
        Self {
            status: STATUS_FAILURE.to_string(),
            message: Some(format!("command terminated with non-zero exit code: {}", code)),
            reason: Some(REASON_NON_ZERO_EXIT.to_string()),
            details: Some(StatusDetails {
                causes: vec![StatusCause {
                    reason: CAUSE_EXIT_CODE.to_string(),
                    message: code.to_string(),
                }],
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    /// Exit code to report locally: 0 on success, the reported code when
    /// present, 1 for any other failure.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            return 0;
        }
        self.details
            .as_ref()
            .and_then(|d| d.causes.iter().find(|c| c.reason == CAUSE_EXIT_CODE))
            .and_then(|c| c.message.parse().ok())
            .unwrap_or(1)
    }
}

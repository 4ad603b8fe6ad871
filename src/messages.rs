//! Wire messages exchanged between the supervisor and its workers.
//!
//! Every message is a tagged tuple, `[KIND]` or `[KIND, payload]`, carried as a
//! JSON array. Thread-isolated workers pass the JSON value through a channel;
//! process-isolated workers exchange one JSON array per line over stdin/stdout.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// One undecoded message as it travels over a worker channel.
pub type Frame = Value;

/// Message types of the supervisor/worker protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    // supervisor -> worker
    HeartbeatSyn,
    GetData,
    Stop,
    // worker -> supervisor
    HeartbeatAck,
    StartupError,
    DataOk,
    DataError,
    StopAck,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        MessageKind::HeartbeatSyn,
        MessageKind::GetData,
        MessageKind::Stop,
        MessageKind::HeartbeatAck,
        MessageKind::StartupError,
        MessageKind::DataOk,
        MessageKind::DataError,
        MessageKind::StopAck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeartbeatSyn => "HEARTBEAT_SYN",
            Self::GetData => "GET_DATA",
            Self::Stop => "STOP",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
            Self::StartupError => "STARTUP_ERROR",
            Self::DataOk => "DATA_OK",
            Self::DataError => "DATA_ERROR",
            Self::StopAck => "STOP_ACK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Whether this kind travels supervisor -> worker.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::HeartbeatSyn | Self::GetData | Self::Stop)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while moving frames between supervisor and worker.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a tuple: {0}")]
    NotATuple(String),
    #[error("frame has {0} elements, expected 1 or 2")]
    Arity(usize),
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
    #[error("channel closed")]
    ChannelClosed,
}

/// A decoded, well-formed protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Option<Value>,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    pub fn with_payload(kind: MessageKind, payload: impl Into<Value>) -> Self {
        Self {
            kind,
            payload: Some(payload.into()),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut items = Vec::with_capacity(2);
        items.push(Value::String(self.kind.as_str().to_string()));
        if let Some(payload) = self.payload {
            items.push(payload);
        }
        Value::Array(items)
    }

    /// Decode a frame, accepting only tuples of length 1 or 2 whose first
    /// element names a known message kind. A trailing `null` counts as no
    /// payload.
    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        let Value::Array(items) = frame else {
            return Err(MessageError::NotATuple(truncate(frame.to_string())));
        };
        if !(1..=2).contains(&items.len()) {
            return Err(MessageError::Arity(items.len()));
        }
        let kind = match &items[0] {
            Value::String(tag) => MessageKind::parse(tag)
                .ok_or_else(|| MessageError::UnknownKind(truncate(tag.clone())))?,
            other => return Err(MessageError::UnknownKind(truncate(other.to_string()))),
        };
        let payload = items.get(1).filter(|value| !value.is_null()).cloned();
        Ok(Self { kind, payload })
    }

    /// Render the payload as an error description, as carried by
    /// `STARTUP_ERROR` and `DATA_ERROR`.
    pub fn payload_text(&self) -> Option<String> {
        match &self.payload {
            None => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        message.into_frame()
    }
}

fn truncate(mut text: String) -> String {
    const LIMIT: usize = 120;
    if text.len() > LIMIT {
        let mut cut = LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

/// Parse one line of the line-oriented transport.
///
/// Lines that are not valid JSON are passed on as a JSON string so the
/// receiver treats them as a malformed message instead of a dead transport.
pub fn decode_line(line: &str) -> Frame {
    serde_json::from_str(line.trim()).unwrap_or_else(|_| Value::String(line.trim().to_string()))
}

/// Write a frame as a single JSON line and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), MessageError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame, skipping blank lines. Returns `None` at end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, MessageError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Ok(Some(decode_line(&line)));
        }
    }
}

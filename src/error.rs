//! Session error taxonomy
//!
//! Everything except transport loss is recoverable: it becomes a
//! notification and the routing loop keeps going.

use crate::protocol::ApiError;
use thiserror::Error;

/// Any error the session can surface.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("server error: {}", .0.message)]
    Server(ApiError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Only transport loss ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short machine-readable kind, used in notifications and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::Protocol(_) => "protocol_violation",
            Self::Tool(ToolError::ArgumentsInvalid { .. }) => "tool_arguments_invalid",
            Self::Tool(ToolError::UnknownTool { .. }) => "unknown_tool",
            Self::Tool(ToolError::Execution { .. }) => "tool_execution_error",
            Self::Server(_) => "server_error",
            Self::Transport(_) => "transport_error",
        }
    }
}

/// A payload that could not be parsed into an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to decode event: {reason}")]
pub struct DecodeError {
    pub reason: String,
    /// The offending payload, kept for diagnostics
    pub raw: Vec<u8>,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Lossy UTF-8 view of the payload, truncated for log lines.
    pub fn raw_preview(&self) -> String {
        String::from_utf8_lossy(&self.raw).chars().take(200).collect()
    }
}

/// An inbound event that breaks the ordering contract.
///
/// Raising one never mutates session state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("response {attempted} started while {active} is still active")]
    NestedResponse { active: String, attempted: String },
    #[error("response {0} finished but no response is active")]
    NoActiveResponse(String),
    #[error("response {finished} finished while {active} is active")]
    ResponseMismatch { active: String, finished: String },
    #[error("item has no id")]
    MissingItemId,
    #[error("unknown item {0}")]
    UnknownItem(String),
    #[error("unknown content part {item_id}[{content_index}]")]
    UnknownPart { item_id: String, content_index: u32 },
    #[error("content part {item_id}[{content_index}] added twice")]
    DuplicatePart { item_id: String, content_index: u32 },
    #[error("delta for content part {item_id}[{content_index}] after it was {state}")]
    DeltaAfterTerminal {
        item_id: String,
        content_index: u32,
        state: &'static str,
    },
    #[error("{channel} delta for content part {item_id}[{content_index}] after its stream closed")]
    ChannelClosed {
        item_id: String,
        content_index: u32,
        channel: &'static str,
    },
    #[error("item {item_id} completed with unfinished content part {content_index}")]
    ItemIncomplete { item_id: String, content_index: u32 },
    #[error("malformed audio in {item_id}[{content_index}]: {reason}")]
    MalformedAudio {
        item_id: String,
        content_index: u32,
        reason: String,
    },
    #[error("arguments delta for call {0} after its stream completed")]
    ArgumentsAfterDone(String),
}

/// Failure scoped to a single tool call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("invalid arguments for call {call_id}: {reason}")]
    ArgumentsInvalid {
        call_id: String,
        raw: String,
        reason: String,
    },
    #[error("unknown tool '{name}' for call {call_id}")]
    UnknownTool { call_id: String, name: String },
    #[error("tool call {call_id} failed: {source}")]
    Execution {
        call_id: String,
        source: ToolExecutionError,
    },
}

impl ToolError {
    pub fn call_id(&self) -> &str {
        match self {
            Self::ArgumentsInvalid { call_id, .. }
            | Self::UnknownTool { call_id, .. }
            | Self::Execution { call_id, .. } => call_id,
        }
    }
}

/// Error returned by a tool handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ToolExecutionError {
    pub message: String,
}

impl ToolExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The connection to the server is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// The session's router loop has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session is closed")]
pub struct SessionClosed;

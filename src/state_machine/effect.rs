//! Effects produced by state transitions

use crate::error::SessionError;
use crate::protocol::{ClientEvent, ItemType, ResponseStatus, Usage};
use crate::state_machine::store::{ItemStatus, PartState};
use serde_json::Value;
use std::time::Duration;

/// Effects to be executed, in order, after a transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send a request upstream
    Send(ClientEvent),

    /// Run a tool handler (spawns as background task)
    InvokeTool {
        call_id: String,
        name: String,
        arguments: Value,
    },

    /// Notify presentation-layer subscribers
    Notify(Notification),
}

impl Effect {
    pub fn error(err: impl Into<SessionError>) -> Self {
        Effect::Notify(Notification::Error(err.into()))
    }
}

/// Local notifications for the presentation sink.
#[derive(Debug, Clone)]
pub enum Notification {
    SessionReady {
        session_id: String,
    },
    SessionUpdated,
    ConversationReady {
        conversation_id: String,
    },
    ItemAdded {
        item_id: String,
        item_type: ItemType,
        out_of_order: bool,
    },
    ItemStatusChanged {
        item_id: String,
        status: ItemStatus,
    },
    PartStarted {
        item_id: String,
        content_index: u32,
    },
    TextDelta {
        item_id: String,
        content_index: u32,
        delta: String,
    },
    TranscriptDelta {
        item_id: String,
        content_index: u32,
        delta: String,
    },
    /// Decoded audio for playback
    AudioDelta {
        item_id: String,
        content_index: u32,
        audio: Vec<u8>,
    },
    PartFinished {
        item_id: String,
        content_index: u32,
        state: PartState,
        text: String,
    },
    /// Transcript of committed user audio
    TranscriptionCompleted {
        item_id: String,
        content_index: u32,
        transcript: String,
    },
    /// Stop playback of this part at `audio_end_ms`
    PlaybackInterrupted {
        item_id: String,
        content_index: u32,
        audio_end_ms: u32,
    },
    ResponseStarted {
        response_id: String,
    },
    ResponseFinished {
        response_id: String,
        status: ResponseStatus,
        usage: Option<Usage>,
        /// From the end of the user's turn to the end of this response
        latency: Option<Duration>,
    },
    ToolCallDispatched {
        call_id: String,
        name: String,
    },
    ToolCallResolved {
        call_id: String,
        output: String,
        success: bool,
    },
    RateLimitsUpdated,
    InputAudioCommitted {
        item_id: String,
    },
    InputAudioCleared,
    SpeechStarted,
    SpeechStopped,
    Unrecognized {
        event_type: String,
    },
    Error(SessionError),
}

impl Notification {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionReady { .. } => "session_ready",
            Self::SessionUpdated => "session_updated",
            Self::ConversationReady { .. } => "conversation_ready",
            Self::ItemAdded { .. } => "item_added",
            Self::ItemStatusChanged { .. } => "item_status_changed",
            Self::PartStarted { .. } => "part_started",
            Self::TextDelta { .. } => "text_delta",
            Self::TranscriptDelta { .. } => "transcript_delta",
            Self::AudioDelta { .. } => "audio_delta",
            Self::PartFinished { .. } => "part_finished",
            Self::TranscriptionCompleted { .. } => "transcription_completed",
            Self::PlaybackInterrupted { .. } => "playback_interrupted",
            Self::ResponseStarted { .. } => "response_started",
            Self::ResponseFinished { .. } => "response_finished",
            Self::ToolCallDispatched { .. } => "tool_call_dispatched",
            Self::ToolCallResolved { .. } => "tool_call_resolved",
            Self::RateLimitsUpdated => "rate_limits_updated",
            Self::InputAudioCommitted { .. } => "input_audio_committed",
            Self::InputAudioCleared => "input_audio_cleared",
            Self::SpeechStarted => "speech_started",
            Self::SpeechStopped => "speech_stopped",
            Self::Unrecognized { .. } => "unrecognized",
            Self::Error(_) => "error",
        }
    }
}

//! Server events.
//!
//! One variant per inbound event type the session consumes, plus an
//! `Unrecognized` fallback that the decoder produces for any other `type`
//! so the session can keep going when the server adds new events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conversation::{ContentPart, ConversationItem};
use super::response::Response;
use super::session::Session;

// ============================================================================
// Supporting Types
// ============================================================================

/// Error details carried by a server `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error type (e.g. "invalid_request_error")
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    /// Client event that triggered the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Conversation object from `conversation.created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
}

/// One rate limit entry from `rate_limits.updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Limit kind (e.g. "requests", "tokens")
    pub name: String,
    #[serde(default)]
    pub limit: u64,
    pub remaining: u64,
    #[serde(default)]
    pub reset_seconds: f64,
}

// ============================================================================
// Server Event Enum
// ============================================================================

/// All inbound events the session state machine interprets.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Server-reported error
    #[serde(rename = "error")]
    Error { error: ApiError },

    /// Session established on connect
    #[serde(rename = "session.created")]
    SessionCreated { session: Session },

    /// Session configuration acknowledged
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Session },

    #[serde(rename = "conversation.created")]
    ConversationCreated { conversation: Conversation },

    /// An item entered the conversation
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        previous_item_id: Option<String>,
        item: ConversationItem,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted {
        item_id: String,
        content_index: u32,
        transcript: String,
    },

    /// Acknowledgement of a truncate request
    #[serde(rename = "conversation.item.truncated")]
    ConversationItemTruncated {
        item_id: String,
        content_index: u32,
        audio_end_ms: u32,
    },

    #[serde(rename = "response.created")]
    ResponseCreated { response: Response },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        output_index: u32,
        item: ConversationItem,
    },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        output_index: u32,
        item: ConversationItem,
    },

    #[serde(rename = "response.content_part.added")]
    ContentPartAdded {
        #[serde(default)]
        response_id: String,
        item_id: String,
        content_index: u32,
        part: ContentPart,
    },

    #[serde(rename = "response.content_part.done")]
    ContentPartDone {
        #[serde(default)]
        response_id: String,
        item_id: String,
        content_index: u32,
        part: ContentPart,
    },

    #[serde(rename = "response.text.delta")]
    TextDelta {
        item_id: String,
        content_index: u32,
        delta: String,
    },

    #[serde(rename = "response.text.done")]
    TextDone {
        item_id: String,
        content_index: u32,
        text: String,
    },

    /// Base64-encoded audio fragment
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        item_id: String,
        content_index: u32,
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone { item_id: String, content_index: u32 },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        item_id: String,
        content_index: u32,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        item_id: String,
        content_index: u32,
        transcript: String,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        item_id: String,
        call_id: String,
        delta: String,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        item_id: String,
        call_id: String,
        arguments: String,
        /// Present on newer protocol revisions
        #[serde(default)]
        name: Option<String>,
    },

    #[serde(rename = "response.done")]
    ResponseDone { response: Response },

    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated { rate_limits: Vec<RateLimit> },

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        previous_item_id: Option<String>,
        item_id: String,
    },

    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioBufferCleared,

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u32,
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u32,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Any event type not listed above; produced only by the decoder
    #[serde(skip)]
    Unrecognized { raw_type: String, raw_payload: Value },
}

impl ServerEvent {
    /// Every `type` value the decoder maps onto a typed variant.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "error",
        "session.created",
        "session.updated",
        "conversation.created",
        "conversation.item.created",
        "conversation.item.input_audio_transcription.completed",
        "conversation.item.truncated",
        "response.created",
        "response.output_item.added",
        "response.output_item.done",
        "response.content_part.added",
        "response.content_part.done",
        "response.text.delta",
        "response.text.done",
        "response.audio.delta",
        "response.audio.done",
        "response.audio_transcript.delta",
        "response.audio_transcript.done",
        "response.function_call_arguments.delta",
        "response.function_call_arguments.done",
        "response.done",
        "rate_limits.updated",
        "input_audio_buffer.committed",
        "input_audio_buffer.cleared",
        "input_audio_buffer.speech_started",
        "input_audio_buffer.speech_stopped",
    ];

    /// Wire name of this event.
    pub fn event_type(&self) -> &str {
        match self {
            Self::Error { .. } => "error",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::ConversationCreated { .. } => "conversation.created",
            Self::ConversationItemCreated { .. } => "conversation.item.created",
            Self::InputAudioTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::ConversationItemTruncated { .. } => "conversation.item.truncated",
            Self::ResponseCreated { .. } => "response.created",
            Self::OutputItemAdded { .. } => "response.output_item.added",
            Self::OutputItemDone { .. } => "response.output_item.done",
            Self::ContentPartAdded { .. } => "response.content_part.added",
            Self::ContentPartDone { .. } => "response.content_part.done",
            Self::TextDelta { .. } => "response.text.delta",
            Self::TextDone { .. } => "response.text.done",
            Self::AudioDelta { .. } => "response.audio.delta",
            Self::AudioDone { .. } => "response.audio.done",
            Self::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::AudioTranscriptDone { .. } => "response.audio_transcript.done",
            Self::FunctionCallArgumentsDelta { .. } => "response.function_call_arguments.delta",
            Self::FunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            Self::ResponseDone { .. } => "response.done",
            Self::RateLimitsUpdated { .. } => "rate_limits.updated",
            Self::InputAudioBufferCommitted { .. } => "input_audio_buffer.committed",
            Self::InputAudioBufferCleared => "input_audio_buffer.cleared",
            Self::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            Self::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            Self::Unrecognized { raw_type, .. } => raw_type,
        }
    }

    /// Whether this is a high-frequency streaming fragment (kept out of info logs).
    pub fn is_delta(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. }
                | Self::AudioDelta { .. }
                | Self::AudioTranscriptDelta { .. }
                | Self::FunctionCallArgumentsDelta { .. }
        )
    }
}

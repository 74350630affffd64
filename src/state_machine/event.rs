//! Events that drive the session state machine

use crate::error::ToolError;
use crate::protocol::{ServerEvent, SessionConfig};
use serde_json::Value;

/// Everything the router processes, in arrival order.
///
/// Server events come from the transport; the rest are caller commands and
/// tool completions fed through the same queue.
#[derive(Debug, Clone)]
pub enum Event {
    /// Decoded inbound event
    Server(ServerEvent),

    // Local signals
    SpeechStarted,
    SpeechStopped,
    PlaybackProgress {
        item_id: String,
        content_index: u32,
        played_ms: u32,
    },

    /// A spawned tool handler finished
    ToolFinished {
        call_id: String,
        outcome: Result<Value, ToolError>,
    },

    // Caller commands
    UpdateSession(SessionConfig),
    UserText {
        prompts: Vec<String>,
    },
    AppendAudio {
        audio: Vec<u8>,
    },
    CommitAudio,
    ClearAudio,
    CreateResponse,
}

impl Event {
    pub fn kind(&self) -> &str {
        match self {
            Event::Server(event) => event.event_type(),
            Event::SpeechStarted => "local.speech_started",
            Event::SpeechStopped => "local.speech_stopped",
            Event::PlaybackProgress { .. } => "local.playback_progress",
            Event::ToolFinished { .. } => "local.tool_finished",
            Event::UpdateSession(_) => "local.update_session",
            Event::UserText { .. } => "local.user_text",
            Event::AppendAudio { .. } => "local.append_audio",
            Event::CommitAudio => "local.commit_audio",
            Event::ClearAudio => "local.clear_audio",
            Event::CreateResponse => "local.create_response",
        }
    }
}

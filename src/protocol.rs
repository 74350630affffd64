//! Typed wire model for the realtime event protocol
//!
//! Server events arrive as JSON objects tagged by a `type` field; client
//! events are serialized the same way. The core only exchanges these
//! structured values with the transport, never raw frames.

pub mod client_events;
pub mod conversation;
pub mod response;
pub mod server_events;
pub mod session;

pub use client_events::{ClientEvent, ResponseCreateParams};
pub use conversation::{ContentPart, ConversationItem, ItemType, Role, WireItemStatus};
pub use response::{Response, ResponseStatus, Usage};
pub use server_events::{ApiError, Conversation, RateLimit, ServerEvent};
pub use session::{
    AudioFormat, InputAudioTranscription, MaxResponseOutputTokens, Modality, Session,
    SessionConfig, ToolChoice, ToolDefinition, TurnDetection,
};

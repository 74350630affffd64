//! Realtime session - client-side state machine for a streaming
//! conversational protocol
//!
//! Consumes typed server events, keeps a local model of the conversation,
//! assembles streamed deltas, coordinates interruption, and dispatches tool
//! calls back into the conversation.

pub mod config;
pub mod decoder;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod state_machine;
pub mod tools;

pub use config::RealtimeConfig;
pub use error::{SessionClosed, SessionError};
pub use runtime::{SessionHandle, SessionRuntime};
pub use tools::{Tool, ToolRegistry};

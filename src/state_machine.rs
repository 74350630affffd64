//! Session event-stream state machine
//!
//! Elm-style: [`transition`] applies one [`Event`] to the [`SessionMachine`]
//! and returns [`Effect`]s; the runtime executes them.

pub mod assembler;
pub mod dispatcher;
mod effect;
pub mod event;
pub mod interruption;
pub mod store;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use assembler::{Completion, CompletedArguments, DeltaAssembler, TextChannel};
pub use dispatcher::{ToolCall, ToolCallDispatcher, ToolCallState};
pub use effect::{Effect, Notification};
pub use event::Event;
pub use interruption::{InterruptionCoordinator, InterruptionState, TruncateRequest};
pub use store::{ContentPart, Item, ItemStatus, PartKind, PartState, ResponseRecord, SessionStore};
pub use transition::{transition, SessionMachine, TransitionResult};

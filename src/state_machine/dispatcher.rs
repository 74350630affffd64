//! Tool call dispatcher
//!
//! Turns finished argument streams into tool invocations and tool results
//! into `function_call_output` items. Handlers run outside the router; their
//! results come back as [`Event::ToolFinished`](super::Event::ToolFinished)
//! and are applied here one at a time.

use super::assembler::CompletedArguments;
use super::effect::{Effect, Notification};
use super::store::{Item, SessionStore};
use crate::error::ToolError;
use crate::protocol::{ClientEvent, ConversationItem};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Resolution state of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallState {
    /// Arguments still streaming
    Collecting,
    /// Arguments complete, not yet parsed
    CompleteUnparsed,
    /// Handler running
    Dispatched,
    Resolved,
    Failed,
}

impl ToolCallState {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }
}

/// A tool call that is collecting arguments or awaiting its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub call_id: String,
    pub item_id: String,
    pub name: Option<String>,
    pub arguments: String,
    pub state: ToolCallState,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallDispatcher {
    /// Open calls only; settled calls move to `settled`
    calls: HashMap<String, ToolCall>,
    settled: HashMap<String, ToolCallState>,
    /// A tool output was submitted and `response.create` has not followed yet
    continuation_pending: bool,
}

impl ToolCallDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, call_id: &str) -> Option<ToolCallState> {
        self.calls
            .get(call_id)
            .map(|c| c.state)
            .or_else(|| self.settled.get(call_id).copied())
    }

    pub fn call(&self, call_id: &str) -> Option<&ToolCall> {
        self.calls.get(call_id)
    }

    /// Whether the call has produced its output (or was abandoned).
    pub fn is_settled(&self, call_id: &str) -> bool {
        self.settled.contains_key(call_id)
    }

    /// Whether any call still blocks continuation.
    pub fn has_open_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    /// First argument fragment for a call.
    pub fn on_arguments_started(&mut self, item_id: &str, call_id: &str) {
        if self.settled.contains_key(call_id) {
            return;
        }
        self.calls
            .entry(call_id.to_string())
            .or_insert_with(|| ToolCall {
                call_id: call_id.to_string(),
                item_id: item_id.to_string(),
                name: None,
                arguments: String::new(),
                state: ToolCallState::Collecting,
            });
    }

    /// Arguments finished: parse and dispatch, or fail the call.
    ///
    /// Each call id is dispatched at most once; repeats are ignored.
    pub fn on_arguments_complete(
        &mut self,
        store: &mut SessionStore,
        done: CompletedArguments,
    ) -> Vec<Effect> {
        if self.settled.contains_key(&done.call_id)
            || self
                .calls
                .get(&done.call_id)
                .is_some_and(|c| c.state != ToolCallState::Collecting)
        {
            tracing::debug!(call_id = %done.call_id, "Ignoring duplicate argument completion");
            return vec![];
        }

        let CompletedArguments {
            call_id,
            item_id,
            name,
            arguments,
        } = done;
        self.calls.insert(
            call_id.clone(),
            ToolCall {
                call_id: call_id.clone(),
                item_id,
                name: name.clone(),
                arguments: arguments.clone(),
                state: ToolCallState::CompleteUnparsed,
            },
        );

        let raw = if arguments.trim().is_empty() {
            "{}"
        } else {
            arguments.as_str()
        };
        let parsed = match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(e) => {
                let err = ToolError::ArgumentsInvalid {
                    call_id: call_id.clone(),
                    raw: arguments,
                    reason: e.to_string(),
                };
                tracing::warn!(call_id = %call_id, error = %err, "Tool arguments invalid");
                return self.settle(store, &call_id, Err(err));
            }
        };

        let Some(name) = name else {
            let err = ToolError::UnknownTool {
                call_id: call_id.clone(),
                name: String::new(),
            };
            tracing::warn!(call_id = %call_id, "Tool call has no function name");
            return self.settle(store, &call_id, Err(err));
        };

        if let Some(call) = self.calls.get_mut(&call_id) {
            call.state = ToolCallState::Dispatched;
        }
        tracing::info!(call_id = %call_id, tool = %name, "Dispatching tool call");
        vec![
            Effect::Notify(Notification::ToolCallDispatched {
                call_id: call_id.clone(),
                name: name.clone(),
            }),
            Effect::InvokeTool {
                call_id,
                name,
                arguments: parsed,
            },
        ]
    }

    /// A handler finished. Results for calls that are not dispatched
    /// (duplicates, or after close) are dropped.
    pub fn on_tool_finished(
        &mut self,
        store: &mut SessionStore,
        call_id: &str,
        outcome: Result<Value, ToolError>,
    ) -> Vec<Effect> {
        if self.state(call_id) != Some(ToolCallState::Dispatched) {
            tracing::debug!(call_id = %call_id, "Dropping result for call that is not dispatched");
            return vec![];
        }
        self.settle(store, call_id, outcome)
    }

    /// Submit the call's output item and, if nothing blocks it, continue.
    fn settle(
        &mut self,
        store: &mut SessionStore,
        call_id: &str,
        outcome: Result<Value, ToolError>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let (output, state) = match outcome {
            Ok(value) => (value.to_string(), ToolCallState::Resolved),
            Err(err) => {
                let output = json!({ "error": error_message(&err) }).to_string();
                effects.push(Effect::error(err));
                (output, ToolCallState::Failed)
            }
        };

        self.calls.remove(call_id);
        self.settled.insert(call_id.to_string(), state);

        let item_id = new_item_id();
        store.insert_local_item(Item::local_output(&item_id, call_id, &output));
        effects.push(Effect::Send(ClientEvent::create_item(
            ConversationItem::function_call_output(&item_id, call_id, &output),
        )));
        effects.push(Effect::Notify(Notification::ToolCallResolved {
            call_id: call_id.to_string(),
            output,
            success: state == ToolCallState::Resolved,
        }));

        self.continuation_pending = true;
        effects.extend(self.try_continue(store));
        effects
    }

    /// Request the next response once no response is active and no sibling
    /// call is still open.
    pub fn try_continue(&mut self, store: &SessionStore) -> Option<Effect> {
        if !self.continuation_pending || store.active_response().is_some() || self.has_open_calls()
        {
            return None;
        }
        self.continuation_pending = false;
        tracing::debug!("Requesting continuation after tool output");
        Some(Effect::Send(ClientEvent::response_create()))
    }

    /// Ask for a response now, or as soon as nothing blocks one.
    pub fn request_continuation(&mut self, store: &SessionStore) -> Option<Effect> {
        self.continuation_pending = true;
        self.try_continue(store)
    }

    /// Whether a continuation is deferred.
    pub fn continuation_pending(&self) -> bool {
        self.continuation_pending
    }

    /// The response carrying these calls finished before their arguments
    /// did. Calls still collecting can never complete; they fail without an
    /// output so they no longer block continuation.
    pub fn abandon_collecting(&mut self) -> Vec<String> {
        let abandoned: Vec<String> = self
            .calls
            .values()
            .filter(|c| c.state == ToolCallState::Collecting)
            .map(|c| c.call_id.clone())
            .collect();
        for call_id in &abandoned {
            tracing::warn!(call_id = %call_id, "Response ended before call arguments completed");
            self.calls.remove(call_id);
            self.settled.insert(call_id.clone(), ToolCallState::Failed);
        }
        abandoned
    }

    /// Forget open calls; late results will be dropped.
    pub fn close(&mut self) {
        for (call_id, _) in self.calls.drain() {
            self.settled.insert(call_id, ToolCallState::Failed);
        }
        self.continuation_pending = false;
    }
}

fn error_message(err: &ToolError) -> String {
    match err {
        ToolError::Execution { source, .. } => source.message.clone(),
        other => other.to_string(),
    }
}

/// Client-generated item id, at most 32 characters.
fn new_item_id() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(27).collect();
    format!("item_{suffix}")
}

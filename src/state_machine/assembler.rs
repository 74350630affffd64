//! Delta assembler
//!
//! Accumulates streamed fragments into content parts (keyed by item id and
//! content index) and into function call argument buffers (keyed by call id).
//! Accumulated text is a live preview only: every `done` carries the
//! authoritative value and that value replaces whatever was accumulated.

use super::store::{ContentPart, PartState, SessionStore};
use crate::error::ProtocolViolation;
use crate::protocol::ContentPart as WirePart;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;

/// Which text stream of a part a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextChannel {
    Text,
    /// Transcript of an assistant audio part
    Transcript,
}

impl TextChannel {
    fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Transcript => "transcript",
        }
    }
}

/// A function call whose argument stream has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedArguments {
    pub call_id: String,
    pub item_id: String,
    pub name: Option<String>,
    pub arguments: String,
}

/// One-shot signal that something finished assembling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Part {
        item_id: String,
        content_index: u32,
        state: PartState,
        text: String,
    },
    Arguments(CompletedArguments),
}

#[derive(Debug, Clone, Default)]
struct ArgumentStream {
    item_id: String,
    buffer: String,
    done: bool,
}

/// Argument buffers per call id; content parts live in the store.
#[derive(Debug, Clone, Default)]
pub struct DeltaAssembler {
    arguments: HashMap<String, ArgumentStream>,
}

impl DeltaAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Content parts
    // ------------------------------------------------------------------

    /// Open a part for streaming.
    pub fn on_part_added(
        &self,
        store: &mut SessionStore,
        item_id: &str,
        content_index: u32,
        part: &WirePart,
    ) -> Result<(), ProtocolViolation> {
        let item = store.item_mut(item_id)?;
        if item.part(content_index).is_some() {
            return Err(ProtocolViolation::DuplicatePart {
                item_id: item_id.to_string(),
                content_index,
            });
        }
        item.parts.push(ContentPart::streaming(content_index, part));
        item.parts.sort_by_key(|p| p.index);
        Ok(())
    }

    /// Append a text or transcript fragment.
    pub fn on_text_delta(
        &self,
        store: &mut SessionStore,
        item_id: &str,
        content_index: u32,
        channel: TextChannel,
        delta: &str,
    ) -> Result<(), ProtocolViolation> {
        let part = store.part_mut(item_id, content_index)?;
        ensure_streaming(part, item_id)?;
        if !part.text_open {
            return Err(ProtocolViolation::ChannelClosed {
                item_id: item_id.to_string(),
                content_index,
                channel: channel.name(),
            });
        }
        part.text.push_str(delta);
        Ok(())
    }

    /// Append a base64 audio fragment; returns the decoded bytes.
    ///
    /// The payload is decoded before the part is touched, so a malformed
    /// fragment leaves the buffer unchanged.
    pub fn on_audio_delta(
        &self,
        store: &mut SessionStore,
        item_id: &str,
        content_index: u32,
        delta: &str,
    ) -> Result<Vec<u8>, ProtocolViolation> {
        let part = store.part_mut(item_id, content_index)?;
        ensure_streaming(part, item_id)?;
        if !part.audio_open {
            return Err(ProtocolViolation::ChannelClosed {
                item_id: item_id.to_string(),
                content_index,
                channel: "audio",
            });
        }
        let bytes = BASE64
            .decode(delta)
            .map_err(|e| ProtocolViolation::MalformedAudio {
                item_id: item_id.to_string(),
                content_index,
                reason: e.to_string(),
            })?;
        part.audio.extend_from_slice(&bytes);
        Ok(bytes)
    }

    /// Close a text stream with its authoritative value.
    pub fn on_text_done(
        &self,
        store: &mut SessionStore,
        item_id: &str,
        content_index: u32,
        final_text: &str,
    ) -> Result<Option<Completion>, ProtocolViolation> {
        let part = store.part_mut(item_id, content_index)?;
        final_text.clone_into(&mut part.text);
        part.text_open = false;
        Ok(finish(part, item_id))
    }

    pub fn on_audio_done(
        &self,
        store: &mut SessionStore,
        item_id: &str,
        content_index: u32,
    ) -> Result<Option<Completion>, ProtocolViolation> {
        let part = store.part_mut(item_id, content_index)?;
        part.audio_open = false;
        Ok(finish(part, item_id))
    }

    /// `content_part.done`: closes every channel of the part.
    pub fn on_part_done(
        &self,
        store: &mut SessionStore,
        item_id: &str,
        content_index: u32,
        final_part: &WirePart,
    ) -> Result<Option<Completion>, ProtocolViolation> {
        let part = store.part_mut(item_id, content_index)?;
        if let Some(text) = final_part.text() {
            text.clone_into(&mut part.text);
        }
        part.text_open = false;
        part.audio_open = false;
        Ok(finish(part, item_id))
    }

    // ------------------------------------------------------------------
    // Function call arguments
    // ------------------------------------------------------------------

    pub fn on_arguments_delta(
        &mut self,
        item_id: &str,
        call_id: &str,
        delta: &str,
    ) -> Result<(), ProtocolViolation> {
        let stream = self
            .arguments
            .entry(call_id.to_string())
            .or_insert_with(|| ArgumentStream {
                item_id: item_id.to_string(),
                ..ArgumentStream::default()
            });
        if stream.done {
            return Err(ProtocolViolation::ArgumentsAfterDone(call_id.to_string()));
        }
        stream.buffer.push_str(delta);
        Ok(())
    }

    /// Finish an argument stream. A repeated `done` yields nothing.
    ///
    /// The function name comes from the event when present, otherwise from
    /// the function call item in the store, which also receives the final
    /// arguments.
    pub fn on_arguments_done(
        &mut self,
        store: &mut SessionStore,
        item_id: &str,
        call_id: &str,
        arguments: &str,
        name: Option<&str>,
    ) -> Option<Completion> {
        let stream = self
            .arguments
            .entry(call_id.to_string())
            .or_insert_with(|| ArgumentStream {
                item_id: item_id.to_string(),
                ..ArgumentStream::default()
            });
        if stream.done {
            return None;
        }
        stream.done = true;
        arguments.clone_into(&mut stream.buffer);
        if stream.item_id.is_empty() {
            item_id.clone_into(&mut stream.item_id);
        }

        let item_id = match store.function_call(call_id) {
            Some(item) => item.id.clone(),
            None => stream.item_id.clone(),
        };
        let mut resolved_name = name.map(str::to_string);
        if let Ok(item) = store.item_mut(&item_id) {
            item.arguments = Some(arguments.to_string());
            if resolved_name.is_none() {
                resolved_name.clone_from(&item.name);
            }
        }

        Some(Completion::Arguments(CompletedArguments {
            call_id: call_id.to_string(),
            item_id,
            name: resolved_name,
            arguments: arguments.to_string(),
        }))
    }

    /// Live preview of a call's arguments.
    pub fn arguments(&self, call_id: &str) -> Option<&str> {
        self.arguments.get(call_id).map(|s| s.buffer.as_str())
    }

    pub fn arguments_done(&self, call_id: &str) -> bool {
        self.arguments.get(call_id).is_some_and(|s| s.done)
    }

    /// Drop the buffer of a call that has settled.
    pub fn forget(&mut self, call_id: &str) {
        self.arguments.remove(call_id);
    }

    /// Number of argument buffers held.
    pub fn open_arguments(&self) -> usize {
        self.arguments.len()
    }
}

fn ensure_streaming(part: &ContentPart, item_id: &str) -> Result<(), ProtocolViolation> {
    if part.state.is_terminal() {
        return Err(ProtocolViolation::DeltaAfterTerminal {
            item_id: item_id.to_string(),
            content_index: part.index,
            state: part.state.as_str(),
        });
    }
    Ok(())
}

/// Settle a part once all its channels are closed.
///
/// A part with a truncate request outstanding ends `Truncated`, never `Done`.
/// Terminal parts are left alone, so a repeated `done` is a no-op apart from
/// the value it carries.
fn finish(part: &mut ContentPart, item_id: &str) -> Option<Completion> {
    if part.state.is_terminal() || part.text_open || part.audio_open {
        return None;
    }
    part.state = if part.truncation.is_some() {
        PartState::Truncated
    } else {
        PartState::Done
    };
    Some(Completion::Part {
        item_id: item_id.to_string(),
        content_index: part.index,
        state: part.state,
        text: part.text.clone(),
    })
}

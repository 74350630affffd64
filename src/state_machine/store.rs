//! Session state store
//!
//! Holds the negotiated session, the conversation's ordered items with their
//! content parts, the response history, and the latest rate limits. Only the
//! router mutates it, one event at a time, so any `&SessionStore` is a
//! consistent point-in-time view.

use crate::error::ProtocolViolation;
use crate::protocol::{
    AudioFormat, ContentPart as WirePart, ConversationItem, ItemType, RateLimit, ResponseStatus,
    Role, Session, Usage, WireItemStatus,
};
use std::collections::HashMap;

// ============================================================================
// Items and content parts
// ============================================================================

/// Lifecycle of a conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Submitted by this client, not yet echoed by the server
    Pending,
    InProgress,
    Completed,
    /// Generation stopped early (interruption or cancellation)
    Truncated,
}

impl ItemStatus {
    fn from_wire(status: Option<WireItemStatus>) -> Self {
        match status {
            Some(WireItemStatus::Completed) => Self::Completed,
            Some(WireItemStatus::Incomplete) => Self::Truncated,
            Some(WireItemStatus::InProgress) | None => Self::InProgress,
        }
    }
}

/// What a content part carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    InputText,
    InputAudio,
    Text,
    /// Assistant audio plus its transcript, streamed on two channels
    Audio,
    Other,
}

impl PartKind {
    pub fn of(part: &WirePart) -> Self {
        match part {
            WirePart::InputText { .. } => Self::InputText,
            WirePart::InputAudio { .. } => Self::InputAudio,
            WirePart::Text { .. } => Self::Text,
            WirePart::Audio { .. } => Self::Audio,
            WirePart::Unknown => Self::Other,
        }
    }
}

/// Lifecycle of a content part.
///
/// Streamed parts start in `Streaming`; parts that arrive whole (user input)
/// start in `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Streaming,
    Done,
    Truncated,
}

impl PartState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Truncated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Done => "done",
            Self::Truncated => "truncated",
        }
    }
}

/// A truncate request issued for a part, and whether the server confirmed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub audio_end_ms: u32,
    pub acknowledged: bool,
}

/// One streamed sub-unit of an item.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentPart {
    pub index: u32,
    pub kind: PartKind,
    /// Text, or the transcript for audio parts
    pub text: String,
    /// Decoded audio bytes
    pub audio: Vec<u8>,
    pub state: PartState,
    pub truncation: Option<Truncation>,
    pub(crate) text_open: bool,
    pub(crate) audio_open: bool,
}

impl ContentPart {
    /// A part announced by `content_part.added`, ready for deltas.
    pub fn streaming(index: u32, part: &WirePart) -> Self {
        let kind = PartKind::of(part);
        Self {
            index,
            kind,
            text: part.text().unwrap_or_default().to_string(),
            audio: Vec::new(),
            state: PartState::Streaming,
            truncation: None,
            text_open: true,
            audio_open: kind == PartKind::Audio,
        }
    }

    /// A part that arrived complete inside an item.
    pub fn complete(index: u32, part: &WirePart) -> Self {
        Self {
            state: PartState::Done,
            text_open: false,
            audio_open: false,
            ..Self::streaming(index, part)
        }
    }

    pub fn truncation_pending(&self) -> bool {
        self.truncation.is_some_and(|t| !t.acknowledged)
    }
}

/// A durable unit of conversation history.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    pub item_type: ItemType,
    pub status: ItemStatus,
    pub role: Option<Role>,
    pub parts: Vec<ContentPart>,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
    pub output: Option<String>,
    /// Inserted although its `previous_item_id` was unknown
    pub out_of_order: bool,
}

impl Item {
    fn from_wire(id: String, item: &ConversationItem) -> Self {
        Self {
            id,
            item_type: item.item_type,
            status: ItemStatus::from_wire(item.status),
            role: item.role,
            parts: item
                .content
                .iter()
                .zip(0u32..)
                .map(|(part, index)| ContentPart::complete(index, part))
                .collect(),
            call_id: item.call_id.clone(),
            name: item.name.clone(),
            arguments: item.arguments.clone(),
            output: item.output.clone(),
            out_of_order: false,
        }
    }

    /// A function call output submitted by this client.
    pub fn local_output(id: impl Into<String>, call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            item_type: ItemType::FunctionCallOutput,
            status: ItemStatus::Pending,
            role: None,
            parts: Vec::new(),
            call_id: Some(call_id.into()),
            name: None,
            arguments: None,
            output: Some(output.into()),
            out_of_order: false,
        }
    }

    pub fn part(&self, content_index: u32) -> Option<&ContentPart> {
        self.parts.iter().find(|p| p.index == content_index)
    }

    pub fn part_mut(&mut self, content_index: u32) -> Option<&mut ContentPart> {
        self.parts.iter_mut().find(|p| p.index == content_index)
    }

    /// First part that is neither done nor truncated.
    pub fn unfinished_part(&self) -> Option<&ContentPart> {
        self.parts.iter().find(|p| !p.state.is_terminal())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// One generation turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRecord {
    pub id: String,
    pub status: ResponseStatus,
    /// Output item ids in the order they were added
    pub output: Vec<String>,
    pub usage: Option<Usage>,
}

/// Result of inserting an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemInsert {
    Inserted { out_of_order: bool },
    /// The item was already known (e.g. `output_item.added` then `item.created`)
    AlreadyPresent,
}

// ============================================================================
// Store
// ============================================================================

/// The authoritative local model of one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStore {
    session: Option<Session>,
    conversation_id: Option<String>,
    order: Vec<String>,
    items: HashMap<String, Item>,
    /// The response being generated, if any
    active: Option<ResponseRecord>,
    /// Finished responses, oldest first
    finished: Vec<ResponseRecord>,
    rate_limits: HashMap<String, RateLimit>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- session ---

    pub fn apply_session_created(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn apply_session_updated(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Whether the server commits the input buffer itself (server VAD).
    pub fn server_commits_audio(&self) -> bool {
        self.session
            .as_ref()
            .map_or(true, |s| s.config.server_commits_audio())
    }

    pub fn output_audio_format(&self) -> Option<AudioFormat> {
        self.session
            .as_ref()
            .and_then(|s| s.config.output_audio_format)
    }

    // --- conversation ---

    pub fn apply_conversation_created(&mut self, id: impl Into<String>) {
        self.conversation_id = Some(id.into());
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Insert an item after `previous_item_id`, or at the end.
    ///
    /// An unknown predecessor does not reject the item: it is appended and
    /// flagged `out_of_order`. A known item id is merged instead.
    pub fn apply_item_created(
        &mut self,
        item: &ConversationItem,
        previous_item_id: Option<&str>,
    ) -> Result<ItemInsert, ProtocolViolation> {
        let id = item.id.clone().ok_or(ProtocolViolation::MissingItemId)?;

        if let Some(existing) = self.items.get_mut(&id) {
            if existing.status == ItemStatus::Pending {
                existing.status = match item.status {
                    None => ItemStatus::Completed,
                    status => ItemStatus::from_wire(status),
                };
            }
            return Ok(ItemInsert::AlreadyPresent);
        }

        let position = previous_item_id.map(|prev| self.order.iter().position(|id| id == prev));
        let out_of_order = matches!(position, Some(None));
        match position {
            Some(Some(index)) => self.order.insert(index + 1, id.clone()),
            _ => self.order.push(id.clone()),
        }

        let mut stored = Item::from_wire(id.clone(), item);
        stored.out_of_order = out_of_order;
        self.items.insert(id, stored);
        Ok(ItemInsert::Inserted { out_of_order })
    }

    /// Append an item this client created before the server echoes it.
    pub fn insert_local_item(&mut self, item: Item) {
        if self.items.contains_key(&item.id) {
            return;
        }
        self.order.push(item.id.clone());
        self.items.insert(item.id.clone(), item);
    }

    /// Move an item to a new status.
    ///
    /// `Completed` is refused while any content part is still streaming.
    pub fn apply_item_status_change(
        &mut self,
        item_id: &str,
        status: ItemStatus,
    ) -> Result<(), ProtocolViolation> {
        let item = self
            .items
            .get_mut(item_id)
            .ok_or_else(|| ProtocolViolation::UnknownItem(item_id.to_string()))?;

        if status == ItemStatus::Completed {
            if let Some(part) = item.unfinished_part() {
                return Err(ProtocolViolation::ItemIncomplete {
                    item_id: item_id.to_string(),
                    content_index: part.index,
                });
            }
        }
        item.status = status;
        Ok(())
    }

    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.items.get(item_id)
    }

    pub(crate) fn item_mut(&mut self, item_id: &str) -> Result<&mut Item, ProtocolViolation> {
        self.items
            .get_mut(item_id)
            .ok_or_else(|| ProtocolViolation::UnknownItem(item_id.to_string()))
    }

    pub(crate) fn part_mut(
        &mut self,
        item_id: &str,
        content_index: u32,
    ) -> Result<&mut ContentPart, ProtocolViolation> {
        self.item_mut(item_id)?
            .part_mut(content_index)
            .ok_or_else(|| ProtocolViolation::UnknownPart {
                item_id: item_id.to_string(),
                content_index,
            })
    }

    pub fn part(&self, item_id: &str, content_index: u32) -> Option<&ContentPart> {
        self.items.get(item_id)?.part(content_index)
    }

    /// Items in conversation order.
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }

    /// The function call item that carries `call_id`.
    pub fn function_call(&self, call_id: &str) -> Option<&Item> {
        self.items().find(|item| {
            item.item_type == ItemType::FunctionCall && item.call_id.as_deref() == Some(call_id)
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    // --- responses ---

    pub fn active_response(&self) -> Option<&ResponseRecord> {
        self.active.as_ref()
    }

    /// Start a response; at most one may be active.
    pub fn begin_response(&mut self, id: &str) -> Result<(), ProtocolViolation> {
        if let Some(active) = &self.active {
            return Err(ProtocolViolation::NestedResponse {
                active: active.id.clone(),
                attempted: id.to_string(),
            });
        }
        self.active = Some(ResponseRecord {
            id: id.to_string(),
            status: ResponseStatus::InProgress,
            output: Vec::new(),
            usage: None,
        });
        Ok(())
    }

    /// Finalize the active response and move it to the history.
    pub fn end_response(
        &mut self,
        id: &str,
        status: ResponseStatus,
        usage: Option<Usage>,
    ) -> Result<(), ProtocolViolation> {
        match &self.active {
            None => return Err(ProtocolViolation::NoActiveResponse(id.to_string())),
            Some(active) if active.id != id => {
                return Err(ProtocolViolation::ResponseMismatch {
                    active: active.id.clone(),
                    finished: id.to_string(),
                })
            }
            Some(_) => {}
        }
        if let Some(mut record) = self.active.take() {
            record.status = status;
            record.usage = usage;
            self.finished.push(record);
        }
        Ok(())
    }

    /// Record `item_id` as output of `response_id`, or of the active response.
    pub fn attach_output(&mut self, response_id: &str, item_id: &str) {
        let record = match &mut self.active {
            Some(active) if response_id.is_empty() || active.id == response_id => Some(active),
            _ if response_id.is_empty() => None,
            _ => self.finished.iter_mut().rev().find(|r| r.id == response_id),
        };
        if let Some(record) = record {
            if !record.output.iter().any(|id| id == item_id) {
                record.output.push(item_id.to_string());
            }
        }
    }

    /// A response by id, active or finished.
    pub fn response(&self, id: &str) -> Option<&ResponseRecord> {
        self.active
            .iter()
            .chain(self.finished.iter().rev())
            .find(|r| r.id == id)
    }

    /// Every response in start order; the active one, if any, is last.
    pub fn responses(&self) -> impl Iterator<Item = &ResponseRecord> {
        self.finished.iter().chain(self.active.iter())
    }

    // --- rate limits ---

    /// Last write wins per limit name.
    pub fn apply_rate_limits(&mut self, limits: &[RateLimit]) {
        for limit in limits {
            self.rate_limits.insert(limit.name.clone(), limit.clone());
        }
    }

    pub fn rate_limit(&self, name: &str) -> Option<&RateLimit> {
        self.rate_limits.get(name)
    }
}

//! Conversation item types.
//!
//! Items are messages, function calls, or function call outputs. The wire
//! shape is a single object whose `type` selects which optional fields are
//! meaningful, so it is modelled as one struct rather than a tagged enum.

use serde::{Deserialize, Serialize};

/// A conversation item as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Unique identifier (client may supply one on create)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item kind
    #[serde(rename = "type")]
    pub item_type: ItemType,
    /// Generation status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WireItemStatus>,
    /// Author role (messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Content parts (messages only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentPart>,
    /// Call identifier (function calls and outputs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Function name (function calls only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// JSON-encoded arguments (function calls only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// JSON-encoded output (function call outputs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ConversationItem {
    /// A user message made of text parts.
    pub fn user_text<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            item_type: ItemType::Message,
            role: Some(Role::User),
            content: texts
                .into_iter()
                .map(|text| ContentPart::InputText { text: text.into() })
                .collect(),
            ..Default::default()
        }
    }

    /// A function call output carrying a JSON-encoded result.
    pub fn function_call_output(
        id: impl Into<String>,
        call_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            item_type: ItemType::FunctionCallOutput,
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            ..Default::default()
        }
    }
}

/// Item kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    #[default]
    Message,
    FunctionCall,
    FunctionCallOutput,
}

/// Author role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Item status as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireItemStatus {
    Completed,
    InProgress,
    /// Generation stopped early (interruption or cancellation)
    Incomplete,
}

/// A content part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// User or system text
    InputText { text: String },
    /// User audio; the transcript arrives later if transcription is enabled
    InputAudio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
    /// Assistant text
    Text {
        #[serde(default)]
        text: String,
    },
    /// Assistant audio with its transcript
    Audio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
    /// Part types this client does not model
    #[serde(other)]
    Unknown,
}

impl ContentPart {
    /// The text or transcript carried by this part, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::InputText { text } | Self::Text { text } => Some(text),
            Self::InputAudio { transcript, .. } | Self::Audio { transcript, .. } => {
                transcript.as_deref()
            }
            Self::Unknown => None,
        }
    }
}

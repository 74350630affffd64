//! Response object and usage statistics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conversation::ConversationItem;

/// One generation turn, as carried by `response.created` / `response.done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default = "ResponseStatus::in_progress")]
    pub status: ResponseStatus,
    /// Why the response ended, when it did not complete normally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<Value>,
    #[serde(default)]
    pub output: Vec<ConversationItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    InProgress,
    Completed,
    Cancelled,
    Incomplete,
    Failed,
}

impl ResponseStatus {
    fn in_progress() -> Self {
        Self::InProgress
    }
}

/// Token usage for a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_token_details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_token_details: Option<Value>,
}

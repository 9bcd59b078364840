//! Message, conversation and request/response types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest message body accepted, in characters. Longer bodies are truncated.
pub const MAX_CONTENT_LENGTH: usize = 2000;

/// Length of the conversation preview, in characters
pub const PREVIEW_LENGTH: usize = 100;

/// Body of a soft-deleted message
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

pub const DEFAULT_PAGE_SIZE: u64 = 30;
pub const MAX_PAGE_SIZE: u64 = 100;

/// A stored chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    /// Server timestamp (epoch millis); local clock for optimistic messages
    pub timestamp: i64,
    #[serde(default)]
    pub read_by: BTreeMap<String, bool>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
}

impl Message {
    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.get(user_id).copied().unwrap_or(false)
    }
}

/// Last message shown in the chat list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub content: String,
    pub sender_id: String,
    pub message_id: String,
    pub timestamp: i64,
}

/// Conversation metadata as seen by one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub participants: Vec<String>,
    pub is_group: bool,
    pub message_count: i64,
    pub unread_counters: BTreeMap<String, i64>,
    pub last_message_preview: Option<MessagePreview>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversationSummary {
    pub fn unread_for(&self, user_id: &str) -> i64 {
        self.unread_counters.get(user_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub success: bool,
    pub message_id: String,
    pub conversation_id: String,
    pub server_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    pub success: bool,
    pub conversation_id: String,
}

fn default_page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub conversation_id: String,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_message_id: Option<String>,
}

impl PageRequest {
    pub fn latest(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            page_size: DEFAULT_PAGE_SIZE,
            cursor_message_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
    /// Oldest first
    pub messages: Vec<Message>,
    pub total_count: i64,
    /// Index of the oldest shard the page read from
    pub last_processed_index: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalUnreadResponse {
    pub total_unread: i64,
    pub unread_by_chat: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageRequest {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOrCreateChatRequest {
    pub peer_id: String,
}

/// Authoritative recent messages pushed after every change to a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdate {
    pub conversation_id: String,
    /// Oldest first
    pub messages: Vec<Message>,
}

/// Trim, reject empty, and cap at `max_chars` characters
pub fn normalize_content(raw: &str, max_chars: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(truncate_chars(trimmed, max_chars))
}

/// Truncate on a character boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

//! In-memory backend for one conversation, shared by the sync tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use teebox_dm::{
    now_millis, ApiError, ConversationSummary, DeleteMessageRequest, DeleteMessageResponse,
    ErrorCode, GetOrCreateChatRequest, LiveUpdate, MarkReadRequest, MarkReadResponse, Message,
    PageRequest, PageResponse, RetryConfig, SendMessageRequest, SendMessageResponse,
    TotalUnreadResponse, DELETED_PLACEHOLDER,
};
use teebox_sync::{FailedMessageQueue, MessagingApi, SyncConfig, SyncEngine};
use tokio::sync::broadcast;

pub const CONVERSATION: &str = "dm_alice_bob";
pub const ME: &str = "alice";
pub const PEER: &str = "bob";

#[derive(Default)]
pub struct MockState {
    pub messages: Vec<Message>,
    /// Upcoming sends that fail with `unavailable`
    pub fail_sends: usize,
    /// Store the message before failing, as when the ack is lost
    pub commit_before_fail: bool,
    /// Echo the client's token on stored messages
    pub echo_tokens: bool,
    pub send_calls: usize,
    pub mark_calls: usize,
    pub list_calls: usize,
    next_id: usize,
}

pub struct MockApi {
    pub state: Mutex<MockState>,
    live: broadcast::Sender<LiveUpdate>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        let (live, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(MockState {
                echo_tokens: true,
                ..Default::default()
            }),
            live,
        })
    }

    pub fn fail_next_sends(&self, count: usize, commit: bool) {
        let mut state = self.state.lock();
        state.fail_sends = count;
        state.commit_before_fail = commit;
    }

    pub fn send_calls(&self) -> usize {
        self.state.lock().send_calls
    }

    pub fn mark_calls(&self) -> usize {
        self.state.lock().mark_calls
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn stored(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    /// Store a message from `sender` and push the live update
    pub fn push_from(&self, sender: &str, content: &str) -> Message {
        let message = {
            let mut state = self.state.lock();
            store(&mut state, sender, content, None)
        };
        self.publish();
        message
    }

    pub fn latest_update(&self) -> LiveUpdate {
        let state = self.state.lock();
        let start = state.messages.len().saturating_sub(50);
        LiveUpdate {
            conversation_id: CONVERSATION.to_string(),
            messages: state.messages[start..].to_vec(),
        }
    }

    fn publish(&self) {
        let _ = self.live.send(self.latest_update());
    }

    fn summary(&self) -> ConversationSummary {
        let state = self.state.lock();
        let unread = state
            .messages
            .iter()
            .filter(|m| m.sender_id != ME && !m.is_read_by(ME))
            .count() as i64;
        ConversationSummary {
            id: CONVERSATION.to_string(),
            participants: vec![ME.to_string(), PEER.to_string()],
            is_group: false,
            message_count: state.messages.len() as i64,
            unread_counters: BTreeMap::from([(ME.to_string(), unread)]),
            last_message_preview: None,
            created_at: 0,
            updated_at: now_millis(),
        }
    }
}

fn store(state: &mut MockState, sender: &str, content: &str, token: Option<String>) -> Message {
    state.next_id += 1;
    let message = Message {
        id: format!("m{:04}", state.next_id),
        conversation_id: CONVERSATION.to_string(),
        sender_id: sender.to_string(),
        content: content.to_string(),
        timestamp: now_millis(),
        read_by: BTreeMap::from([(sender.to_string(), true)]),
        deleted: false,
        idempotency_token: token,
    };
    state.messages.push(message.clone());
    message
}

fn check_conversation(conversation_id: &str) -> Result<(), ApiError> {
    if conversation_id == CONVERSATION {
        Ok(())
    } else {
        Err(ApiError::not_found("Conversation not found"))
    }
}

#[async_trait]
impl MessagingApi for MockApi {
    async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, ApiError> {
        check_conversation(&request.conversation_id)?;
        let outcome = {
            let mut state = self.state.lock();
            state.send_calls += 1;

            let existing = request.idempotency_token.as_ref().and_then(|token| {
                state
                    .messages
                    .iter()
                    .find(|m| m.idempotency_token.as_ref() == Some(token))
                    .cloned()
            });

            let failing = state.fail_sends > 0;
            if failing {
                state.fail_sends -= 1;
            }
            if failing && !state.commit_before_fail {
                Err(ApiError::new(ErrorCode::Unavailable, "Backend unavailable"))
            } else {
                let message = match existing {
                    Some(message) => message,
                    None => {
                        let token = request
                            .idempotency_token
                            .clone()
                            .filter(|_| state.echo_tokens);
                        store(&mut state, ME, &request.content, token)
                    }
                };
                if failing {
                    Err(ApiError::new(ErrorCode::Unavailable, "Connection reset"))
                } else {
                    Ok(message)
                }
            }
        };

        let stored_anything = match &outcome {
            Ok(_) => true,
            Err(_) => self.state.lock().commit_before_fail,
        };
        if stored_anything {
            self.publish();
        }

        let message = outcome?;
        Ok(SendMessageResponse {
            success: true,
            message_id: message.id,
            conversation_id: message.conversation_id,
            server_timestamp: message.timestamp,
        })
    }

    async fn mark_as_read(&self, request: MarkReadRequest) -> Result<MarkReadResponse, ApiError> {
        check_conversation(&request.conversation_id)?;
        let mut state = self.state.lock();
        state.mark_calls += 1;
        for message in state.messages.iter_mut() {
            message.read_by.insert(ME.to_string(), true);
        }
        Ok(MarkReadResponse {
            success: true,
            conversation_id: request.conversation_id,
        })
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse, ApiError> {
        check_conversation(&request.conversation_id)?;
        let state = self.state.lock();
        let end = match &request.cursor_message_id {
            Some(cursor) => state
                .messages
                .iter()
                .position(|m| &m.id == cursor)
                .unwrap_or(state.messages.len()),
            None => state.messages.len(),
        };
        let start = end.saturating_sub(request.page_size as usize);
        Ok(PageResponse {
            messages: state.messages[start..end].to_vec(),
            total_count: state.messages.len() as i64,
            last_processed_index: 0,
            has_more: start > 0,
        })
    }

    async fn total_unread(&self) -> Result<TotalUnreadResponse, ApiError> {
        let unread = self.summary().unread_for(ME);
        Ok(TotalUnreadResponse {
            total_unread: unread,
            unread_by_chat: BTreeMap::from([(CONVERSATION.to_string(), unread)]),
        })
    }

    async fn delete_message(
        &self,
        request: DeleteMessageRequest,
    ) -> Result<DeleteMessageResponse, ApiError> {
        check_conversation(&request.conversation_id)?;
        {
            let mut state = self.state.lock();
            let message = state
                .messages
                .iter_mut()
                .find(|m| m.id == request.message_id)
                .ok_or_else(|| ApiError::not_found("Message not found"))?;
            message.deleted = true;
            message.content = DELETED_PLACEHOLDER.to_string();
        }
        self.publish();
        Ok(DeleteMessageResponse { success: true })
    }

    async fn list_chats(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        self.state.lock().list_calls += 1;
        Ok(vec![self.summary()])
    }

    async fn get_or_create_chat(
        &self,
        request: GetOrCreateChatRequest,
    ) -> Result<ConversationSummary, ApiError> {
        if request.peer_id != PEER {
            return Err(ApiError::not_found("User not found"));
        }
        Ok(self.summary())
    }

    async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> Result<broadcast::Receiver<LiveUpdate>, ApiError> {
        check_conversation(conversation_id)?;
        Ok(self.live.subscribe())
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry: RetryConfig::once(),
        call_timeout: Duration::from_secs(5),
        receipt_delay: Duration::from_millis(50),
        receipt_cooldown: Duration::from_millis(100),
        tick_interval: Duration::from_millis(10),
        page_size: 2,
        ..Default::default()
    }
}

/// An engine for alice backed by `api`. Keep the temp file alive for the
/// duration of the test.
pub async fn engine_with(
    api: Arc<MockApi>,
    config: SyncConfig,
) -> (SyncEngine, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let queue = FailedMessageQueue::open(temp_file.path()).await.unwrap();
    let engine = SyncEngine::new(api, ME, config, queue);
    (engine, temp_file)
}

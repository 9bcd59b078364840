//! Request handlers
//!
//! Every handler takes the authenticated caller (`None` when the request
//! carried no identity), validates its input, runs against the store under
//! a per-request deadline and answers with wire types or an [`ApiError`].
//! Mutations push the latest page of the conversation to live subscribers.

use crate::conversation_store::ConversationStore;
use crate::directory::UserDirectory;
use crate::error::{StoreError, StoreResult};
use crate::live::LiveFeed;
use crate::message_log::MessageLog;
use crate::pagination::Paginator;
use crate::read_receipts::ReadReceiptUpdater;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use teebox_dm::{
    with_timeout, ApiError, ConversationSummary, DeleteMessageRequest, DeleteMessageResponse,
    ErrorCode, GetOrCreateChatRequest, LiveUpdate, MarkReadRequest, MarkReadResponse,
    PageRequest, PageResponse, SendMessageRequest, SendMessageResponse, TotalUnreadResponse,
    MAX_PAGE_SIZE,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct MessagingService {
    conversations: ConversationStore,
    log: MessageLog,
    pages: Paginator,
    receipts: ReadReceiptUpdater,
    live: LiveFeed,
    directory: Arc<dyn UserDirectory>,
    request_timeout: Duration,
    live_page_size: u64,
}

impl MessagingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: ConversationStore,
        log: MessageLog,
        pages: Paginator,
        receipts: ReadReceiptUpdater,
        live: LiveFeed,
        directory: Arc<dyn UserDirectory>,
        request_timeout: Duration,
        live_page_size: u64,
    ) -> Self {
        Self {
            conversations,
            log,
            pages,
            receipts,
            live,
            directory,
            request_timeout,
            live_page_size: live_page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn live(&self) -> &LiveFeed {
        &self.live
    }

    pub async fn send_message(
        &self,
        caller: Option<&str>,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, ApiError> {
        let caller = authenticated(caller)?;
        require_id("conversationId", &request.conversation_id)?;
        if request.content.trim().is_empty() {
            return Err(ApiError::invalid_argument("Message content cannot be empty"));
        }
        if let Some(token) = &request.idempotency_token {
            require_id("idempotencyToken", token)?;
        }

        let outcome = self
            .run(self.log.append(
                &request.conversation_id,
                caller,
                &request.content,
                request.idempotency_token.as_deref(),
            ))
            .await?;

        if !outcome.duplicate {
            self.publish_latest(&request.conversation_id).await;
        }

        Ok(SendMessageResponse {
            success: true,
            message_id: outcome.message.id,
            conversation_id: request.conversation_id,
            server_timestamp: outcome.message.timestamp,
        })
    }

    pub async fn mark_as_read(
        &self,
        caller: Option<&str>,
        request: MarkReadRequest,
    ) -> Result<MarkReadResponse, ApiError> {
        let caller = authenticated(caller)?;
        require_id("conversationId", &request.conversation_id)?;

        let report = self
            .run(self.receipts.mark_read(&request.conversation_id, caller))
            .await?;
        if !report.failed_shards.is_empty() {
            // Partially applied receipts are finished by the next call
            warn!(
                "Mark-read for {} in {} left {} shards behind",
                caller,
                request.conversation_id,
                report.failed_shards.len()
            );
        }
        if report.messages_marked > 0 {
            self.publish_latest(&request.conversation_id).await;
        }

        Ok(MarkReadResponse {
            success: true,
            conversation_id: request.conversation_id,
        })
    }

    pub async fn fetch_page(
        &self,
        caller: Option<&str>,
        request: PageRequest,
    ) -> Result<PageResponse, ApiError> {
        let caller = authenticated(caller)?;
        require_id("conversationId", &request.conversation_id)?;
        if request.page_size == 0 || request.page_size > MAX_PAGE_SIZE {
            return Err(ApiError::invalid_argument(format!(
                "pageSize must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        self.run(async {
            self.conversations
                .require_participant(&request.conversation_id, caller)
                .await?;
            self.pages
                .page(
                    &request.conversation_id,
                    request.page_size,
                    request.cursor_message_id.as_deref(),
                )
                .await
        })
        .await
    }

    pub async fn total_unread(&self, caller: Option<&str>) -> Result<TotalUnreadResponse, ApiError> {
        let caller = authenticated(caller)?;
        self.run(self.conversations.total_unread(caller)).await
    }

    pub async fn delete_message(
        &self,
        caller: Option<&str>,
        request: DeleteMessageRequest,
    ) -> Result<DeleteMessageResponse, ApiError> {
        let caller = authenticated(caller)?;
        require_id("conversationId", &request.conversation_id)?;
        require_id("messageId", &request.message_id)?;

        self.run(async {
            self.conversations
                .require_participant(&request.conversation_id, caller)
                .await?;
            self.log
                .soft_delete(&request.conversation_id, &request.message_id, caller)
                .await
        })
        .await?;
        self.publish_latest(&request.conversation_id).await;

        Ok(DeleteMessageResponse { success: true })
    }

    pub async fn get_or_create_chat(
        &self,
        caller: Option<&str>,
        request: GetOrCreateChatRequest,
    ) -> Result<ConversationSummary, ApiError> {
        let caller = authenticated(caller)?;
        require_id("peerId", &request.peer_id)?;

        let peer_known = with_timeout(
            self.request_timeout,
            self.directory.user_exists(&request.peer_id),
        )
        .await?;
        if !peer_known {
            return Err(StoreError::UserNotFound(request.peer_id).into());
        }

        self.run(
            self.conversations
                .get_or_create_direct(caller, &request.peer_id),
        )
        .await
    }

    pub async fn create_group(
        &self,
        caller: Option<&str>,
        members: Vec<String>,
    ) -> Result<ConversationSummary, ApiError> {
        let caller = authenticated(caller)?;
        for member in &members {
            require_id("members", member)?;
            if !with_timeout(self.request_timeout, self.directory.user_exists(member)).await? {
                return Err(StoreError::UserNotFound(member.clone()).into());
            }
        }

        self.run(self.conversations.create_group(caller, &members))
            .await
    }

    /// Leave a group, or archive a direct chat
    pub async fn leave_chat(&self, caller: Option<&str>, conversation_id: &str) -> Result<(), ApiError> {
        let caller = authenticated(caller)?;
        require_id("conversationId", conversation_id)?;

        self.run(async {
            let conversation = self
                .conversations
                .require_participant(conversation_id, caller)
                .await?;
            if conversation.is_group {
                self.conversations
                    .remove_participant(conversation_id, caller)
                    .await
            } else {
                self.conversations.archive(conversation_id, caller).await
            }
        })
        .await
    }

    pub async fn list_chats(&self, caller: Option<&str>) -> Result<Vec<ConversationSummary>, ApiError> {
        let caller = authenticated(caller)?;
        self.run(self.conversations.list_for_user(caller)).await
    }

    /// Live updates for one conversation the caller takes part in
    pub async fn subscribe(
        &self,
        caller: Option<&str>,
        conversation_id: &str,
    ) -> Result<broadcast::Receiver<LiveUpdate>, ApiError> {
        let caller = authenticated(caller)?;
        require_id("conversationId", conversation_id)?;
        self.run(self.conversations.require_participant(conversation_id, caller))
            .await?;

        debug!("{} subscribed to {}", caller, conversation_id);
        Ok(self.live.subscribe(conversation_id))
    }

    async fn run<T, F>(&self, operation: F) -> Result<T, ApiError>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let result = with_timeout(self.request_timeout, async {
            operation.await.map_err(|e| {
                if e.code() == ErrorCode::Internal || e.code() == ErrorCode::ResourceExhausted {
                    error!("Request failed: {}", e);
                }
                ApiError::from(e)
            })
        })
        .await;

        if let Err(e) = &result {
            debug!("Request rejected with {}", e);
        }
        result
    }

    /// Push the newest messages to whoever watches the conversation
    async fn publish_latest(&self, conversation_id: &str) {
        if self.live.subscriber_count(conversation_id) == 0 {
            return;
        }

        match self
            .pages
            .page(conversation_id, self.live_page_size, None)
            .await
        {
            Ok(page) => {
                let delivered = self.live.publish(LiveUpdate {
                    conversation_id: conversation_id.to_string(),
                    messages: page.messages,
                });
                info!("Live update for {} reached {} subscribers", conversation_id, delivered);
            }
            Err(e) => warn!("Could not build live update for {}: {}", conversation_id, e),
        }
    }
}

fn authenticated(caller: Option<&str>) -> Result<&str, ApiError> {
    match caller {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(ApiError::unauthenticated()),
    }
}

fn require_id(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::invalid_argument(format!("{} is required", field)));
    }
    Ok(())
}

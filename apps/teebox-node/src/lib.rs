//! Teebox node - runs the message store in-process
//!
//! [`LocalApi`] lets a client [`teebox_sync::SyncEngine`] talk to a
//! [`MessagingService`] in the same process, on behalf of one user.

use async_trait::async_trait;
use teebox_dm::{
    ApiError, ConversationSummary, DeleteMessageRequest, DeleteMessageResponse,
    GetOrCreateChatRequest, LiveUpdate, MarkReadRequest, MarkReadResponse, PageRequest,
    PageResponse, SendMessageRequest, SendMessageResponse, TotalUnreadResponse,
};
use teebox_store::MessagingService;
use teebox_sync::MessagingApi;
use tokio::sync::broadcast;

/// Calls `service` as `user_id`
#[derive(Clone)]
pub struct LocalApi {
    service: MessagingService,
    user_id: String,
}

impl LocalApi {
    pub fn new(service: MessagingService, user_id: impl Into<String>) -> Self {
        Self {
            service,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn caller(&self) -> Option<&str> {
        Some(self.user_id.as_str())
    }
}

#[async_trait]
impl MessagingApi for LocalApi {
    async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, ApiError> {
        self.service.send_message(self.caller(), request).await
    }

    async fn mark_as_read(&self, request: MarkReadRequest) -> Result<MarkReadResponse, ApiError> {
        self.service.mark_as_read(self.caller(), request).await
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse, ApiError> {
        self.service.fetch_page(self.caller(), request).await
    }

    async fn total_unread(&self) -> Result<TotalUnreadResponse, ApiError> {
        self.service.total_unread(self.caller()).await
    }

    async fn delete_message(
        &self,
        request: DeleteMessageRequest,
    ) -> Result<DeleteMessageResponse, ApiError> {
        self.service.delete_message(self.caller(), request).await
    }

    async fn list_chats(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        self.service.list_chats(self.caller()).await
    }

    async fn get_or_create_chat(
        &self,
        request: GetOrCreateChatRequest,
    ) -> Result<ConversationSummary, ApiError> {
        self.service.get_or_create_chat(self.caller(), request).await
    }

    async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> Result<broadcast::Receiver<LiveUpdate>, ApiError> {
        self.service.subscribe(self.caller(), conversation_id).await
    }
}

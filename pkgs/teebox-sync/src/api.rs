//! The messaging backend as seen from the client

use async_trait::async_trait;
use teebox_dm::{
    ApiError, ConversationSummary, DeleteMessageRequest, DeleteMessageResponse,
    GetOrCreateChatRequest, LiveUpdate, MarkReadRequest, MarkReadResponse, PageRequest,
    PageResponse, SendMessageRequest, SendMessageResponse, TotalUnreadResponse,
};
use tokio::sync::broadcast;

/// Calls made on behalf of the signed-in user
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn send_message(&self, request: SendMessageRequest)
        -> Result<SendMessageResponse, ApiError>;

    async fn mark_as_read(&self, request: MarkReadRequest) -> Result<MarkReadResponse, ApiError>;

    async fn fetch_page(&self, request: PageRequest) -> Result<PageResponse, ApiError>;

    async fn total_unread(&self) -> Result<TotalUnreadResponse, ApiError>;

    async fn delete_message(
        &self,
        request: DeleteMessageRequest,
    ) -> Result<DeleteMessageResponse, ApiError>;

    async fn list_chats(&self) -> Result<Vec<ConversationSummary>, ApiError>;

    async fn get_or_create_chat(
        &self,
        request: GetOrCreateChatRequest,
    ) -> Result<ConversationSummary, ApiError>;

    /// Authoritative recent messages of one conversation, pushed on every change
    async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> Result<broadcast::Receiver<LiveUpdate>, ApiError>;
}

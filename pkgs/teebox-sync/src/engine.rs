//! Client synchronization engine
//!
//! One engine per signed-in user. Every transition takes `&mut self`, so
//! whoever owns the engine serializes them; the network part of a send
//! ([`SyncEngine::deliver`]) borrows nothing and can run concurrently with
//! other sends.

use crate::api::MessagingApi;
use crate::cache::TtlCache;
use crate::error::{FailureKind, SyncError, SyncResult};
use crate::failed_queue::FailedMessageQueue;
use crate::read_receipts::ReadReceiptScheduler;
use crate::reconcile::{merge_by_id, reconcile, sort_chronologically, MatchKind};
use crate::SyncConfig;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use teebox_dm::{
    normalize_content, now_millis, with_retry, with_timeout, ApiError, ConversationSummary,
    DeleteMessageRequest, GetOrCreateChatRequest, LiveUpdate, MarkReadRequest, Message,
    PageRequest, RetryConfig, SendMessageRequest, SendMessageResponse, TotalUnreadResponse,
    DELETED_PLACEHOLDER, MAX_CONTENT_LENGTH,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConversationState {
    #[default]
    Idle,
    Loading,
    Ready,
}

/// A send that has been shown optimistically and still has to reach the server
#[derive(Debug, Clone)]
pub struct OutgoingSend {
    pub temp_id: String,
    pub request: SendMessageRequest,
    /// Epoch millis of the first attempt; kept across replays
    pub first_attempt_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { message_id: String },
    /// The call failed but the live feed had already shown the message
    AlreadyConfirmed,
    Failed {
        kind: FailureKind,
        user_message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectReport {
    pub pruned: u64,
    pub replayed: usize,
    pub requeued: usize,
}

/// Everything a UI needs to render
#[derive(Debug, Clone, Default)]
pub struct ViewSnapshot {
    pub online: bool,
    pub chats: Vec<ConversationSummary>,
    pub conversation_id: Option<String>,
    pub state: ConversationState,
    /// Authoritative and optimistic messages, oldest first
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub is_sending: bool,
    pub last_error: Option<String>,
}

struct ActiveConversation {
    id: String,
    state: ConversationState,
    authoritative: Vec<Message>,
    /// Optimistic messages not yet confirmed
    pending: Vec<Message>,
    has_more: bool,
    total_count: i64,
}

impl ActiveConversation {
    fn loading(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: ConversationState::Loading,
            authoritative: Vec::new(),
            pending: Vec::new(),
            has_more: false,
            total_count: 0,
        }
    }

    fn visible(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .authoritative
            .iter()
            .chain(self.pending.iter())
            .cloned()
            .collect();
        sort_chronologically(&mut messages);
        messages
    }
}

pub struct SyncEngine {
    api: Arc<dyn MessagingApi>,
    user_id: String,
    config: SyncConfig,
    chats: TtlCache<String, ConversationSummary>,
    chat_order: Vec<String>,
    chats_refreshed_at: Option<Instant>,
    active: Option<ActiveConversation>,
    receipts: ReadReceiptScheduler,
    failed: FailedMessageQueue,
    in_flight: HashSet<String>,
    /// In-flight temp ids whose token the live feed has already echoed
    confirmed: HashSet<String>,
    online: bool,
    last_error: Option<String>,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn MessagingApi>,
        user_id: impl Into<String>,
        config: SyncConfig,
        failed: FailedMessageQueue,
    ) -> Self {
        let mut chats = TtlCache::new(config.chat_cache_capacity, config.chat_cache_ttl);
        chats.open();
        let receipts = ReadReceiptScheduler::new(
            config.receipt_delay,
            config.receipt_cooldown,
            config.recent_mark_ttl,
        );

        Self {
            api,
            user_id: user_id.into(),
            config,
            chats,
            chat_order: Vec::new(),
            chats_refreshed_at: None,
            active: None,
            receipts,
            failed,
            in_flight: HashSet::new(),
            confirmed: HashSet::new(),
            online: true,
            last_error: None,
        }
    }

    /// Drop cached state. The engine keeps working but starts cold.
    pub fn close(&mut self) {
        self.chats.close();
        self.chat_order.clear();
        self.chats_refreshed_at = None;
        self.receipts.clear();
        self.active = None;
        info!("Sync engine for {} closed", self.user_id);
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn api(&self) -> Arc<dyn MessagingApi> {
        self.api.clone()
    }

    pub fn failed_queue(&self) -> &FailedMessageQueue {
        &self.failed
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn active_conversation_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.id.as_str())
    }

    pub fn state(&self) -> ConversationState {
        self.active
            .as_ref()
            .map(|a| a.state)
            .unwrap_or(ConversationState::Idle)
    }

    pub fn is_sending(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Visible messages of the open conversation, oldest first
    pub fn messages(&self) -> Vec<Message> {
        self.active.as_ref().map(|a| a.visible()).unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.active.as_ref().map(|a| a.pending.len()).unwrap_or(0)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn note_error(&mut self, error: &SyncError) {
        warn!("Sync error for {}: {}", self.user_id, error);
        self.last_error = Some(match error {
            SyncError::Api(e) => FailureKind::classify(e).user_message().to_string(),
            other => other.to_string(),
        });
    }

    pub fn snapshot(&self, now: Instant) -> ViewSnapshot {
        ViewSnapshot {
            online: self.online,
            chats: self.cached_chats(now),
            conversation_id: self.active.as_ref().map(|a| a.id.clone()),
            state: self.state(),
            messages: self.messages(),
            has_more: self.active.as_ref().is_some_and(|a| a.has_more),
            is_sending: self.is_sending(),
            last_error: self.last_error.clone(),
        }
    }

    fn cached_chats(&self, now: Instant) -> Vec<ConversationSummary> {
        self.chat_order
            .iter()
            .filter_map(|id| self.chats.get(id, now))
            .collect()
    }

    async fn call<T, F>(&self, future: F) -> SyncResult<T>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        Ok(with_timeout(self.config.call_timeout, future).await?)
    }

    /// The chat list, from cache unless it is stale or `force` is set
    pub async fn refresh_chats(&mut self, force: bool) -> SyncResult<Vec<ConversationSummary>> {
        let now = Instant::now();
        let fresh = self
            .chats_refreshed_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.chats.ttl());
        if fresh && !force {
            debug!("Serving chat list from cache");
            return Ok(self.cached_chats(now));
        }

        let api = self.api.clone();
        let chats = self.call(api.list_chats()).await?;

        let now = Instant::now();
        if !self.chats.is_open() {
            self.chats.open();
        }
        self.chat_order = chats.iter().map(|c| c.id.clone()).collect();
        for chat in &chats {
            self.chats.insert(chat.id.clone(), chat.clone(), now);
        }
        self.chats_refreshed_at = Some(now);
        info!("Refreshed {} chats for {}", chats.len(), self.user_id);
        Ok(chats)
    }

    /// Find or create the direct chat with `peer_id` and open it
    pub async fn open_chat_with(&mut self, peer_id: &str) -> SyncResult<String> {
        let api = self.api.clone();
        let summary = self
            .call(api.get_or_create_chat(GetOrCreateChatRequest {
                peer_id: peer_id.to_string(),
            }))
            .await?;

        let id = summary.id.clone();
        if !self.chat_order.contains(&id) {
            self.chat_order.insert(0, id.clone());
        }
        self.chats.insert(id.clone(), summary, Instant::now());

        self.activate(&id).await?;
        Ok(id)
    }

    /// Make `conversation_id` the open conversation and load its newest page
    pub async fn activate(&mut self, conversation_id: &str) -> SyncResult<()> {
        self.receipts.clear();
        self.active = Some(ActiveConversation::loading(conversation_id));

        let api = self.api.clone();
        let result = self
            .call(api.fetch_page(PageRequest {
                conversation_id: conversation_id.to_string(),
                page_size: self.config.page_size,
                cursor_message_id: None,
            }))
            .await;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.active = None;
                return Err(e);
            }
        };

        if let Some(active) = self.active.as_mut() {
            active.authoritative = page.messages;
            sort_chronologically(&mut active.authoritative);
            active.has_more = page.has_more;
            active.total_count = page.total_count;
            active.state = ConversationState::Ready;
            debug!(
                "Opened {} with {} of {} messages",
                conversation_id,
                active.authoritative.len(),
                active.total_count
            );
        }
        self.queue_unread(Instant::now());
        Ok(())
    }

    /// Load the page before the oldest loaded message. Returns how many arrived.
    pub async fn load_older(&mut self) -> SyncResult<usize> {
        let active = self
            .active
            .as_ref()
            .ok_or(SyncError::NoActiveConversation)?;
        let Some(oldest) = active.authoritative.first() else {
            return Ok(0);
        };
        if !active.has_more {
            return Ok(0);
        }

        let request = PageRequest {
            conversation_id: active.id.clone(),
            page_size: self.config.page_size,
            cursor_message_id: Some(oldest.id.clone()),
        };
        let api = self.api.clone();
        let page = self.call(api.fetch_page(request)).await?;

        let loaded = page.messages.len();
        if let Some(active) = self.active.as_mut() {
            merge_by_id(&mut active.authoritative, page.messages);
            active.has_more = page.has_more;
            active.total_count = page.total_count;
        }
        self.queue_unread(Instant::now());
        Ok(loaded)
    }

    /// Show `content` as an optimistic message and prepare its request
    pub fn begin_send(&mut self, content: &str) -> SyncResult<OutgoingSend> {
        self.begin_send_at(content, now_millis())
    }

    fn begin_send_at(&mut self, content: &str, first_attempt_at: i64) -> SyncResult<OutgoingSend> {
        let active = self
            .active
            .as_mut()
            .ok_or(SyncError::NoActiveConversation)?;
        let content = normalize_content(content, MAX_CONTENT_LENGTH).ok_or_else(|| {
            SyncError::InvalidArgument("Message content cannot be empty".to_string())
        })?;

        let temp_id = format!("tmp_{}", uuid::Uuid::new_v4());
        active.pending.push(Message {
            id: temp_id.clone(),
            conversation_id: active.id.clone(),
            sender_id: self.user_id.clone(),
            content: content.clone(),
            timestamp: now_millis(),
            read_by: BTreeMap::from([(self.user_id.clone(), true)]),
            deleted: false,
            idempotency_token: Some(temp_id.clone()),
        });
        self.in_flight.insert(temp_id.clone());

        debug!("Optimistic message {} in {}", temp_id, active.id);
        Ok(OutgoingSend {
            request: SendMessageRequest {
                conversation_id: active.id.clone(),
                content,
                idempotency_token: Some(temp_id.clone()),
            },
            temp_id,
            first_attempt_at,
        })
    }

    /// Push a prepared send to the server, retrying transient failures
    pub async fn deliver(
        api: Arc<dyn MessagingApi>,
        retry: RetryConfig,
        send: OutgoingSend,
    ) -> (OutgoingSend, Result<SendMessageResponse, ApiError>) {
        let result = with_retry(&retry, || {
            let api = api.clone();
            let request = send.request.clone();
            async move { api.send_message(request).await }
        })
        .await;
        (send, result)
    }

    /// Settle a send: substitute the confirmed message, or roll back the
    /// optimistic one and queue the content for later
    pub async fn complete_send(
        &mut self,
        send: OutgoingSend,
        result: Result<SendMessageResponse, ApiError>,
    ) -> SyncResult<SendOutcome> {
        let outcome = self.settle_send(&send, result);
        if matches!(outcome, SendOutcome::Failed { .. }) {
            self.failed
                .enqueue(
                    &send.request.conversation_id,
                    &send.request.content,
                    send.first_attempt_at,
                )
                .await?;
        }
        Ok(outcome)
    }

    /// Everything [`SyncEngine::complete_send`] does except queueing failures
    fn settle_send(
        &mut self,
        send: &OutgoingSend,
        result: Result<SendMessageResponse, ApiError>,
    ) -> SendOutcome {
        self.in_flight.remove(&send.temp_id);
        let confirmed_by_feed = self.confirmed.remove(&send.temp_id);
        if let Some(active) = self
            .active
            .as_mut()
            .filter(|a| a.id == send.request.conversation_id)
        {
            active.pending.retain(|m| m.id != send.temp_id);
        }

        match result {
            Ok(response) => {
                self.last_error = None;
                if let Some(active) = self
                    .active
                    .as_mut()
                    .filter(|a| a.id == response.conversation_id)
                {
                    if !active.authoritative.iter().any(|m| m.id == response.message_id) {
                        let confirmed = Message {
                            id: response.message_id.clone(),
                            conversation_id: response.conversation_id.clone(),
                            sender_id: self.user_id.clone(),
                            content: send.request.content.clone(),
                            timestamp: response.server_timestamp,
                            read_by: BTreeMap::from([(self.user_id.clone(), true)]),
                            deleted: false,
                            idempotency_token: Some(send.temp_id.clone()),
                        };
                        merge_by_id(&mut active.authoritative, vec![confirmed]);
                    }
                }
                debug!("Message {} delivered as {}", send.temp_id, response.message_id);
                SendOutcome::Delivered {
                    message_id: response.message_id,
                }
            }
            Err(e) if confirmed_by_feed => {
                info!(
                    "Send of {} reported {} but the message is already live",
                    send.temp_id, e
                );
                SendOutcome::AlreadyConfirmed
            }
            Err(e) => {
                let kind = FailureKind::classify(&e);
                warn!("Message {} failed to send: {}", send.temp_id, e);
                let user_message = kind.user_message().to_string();
                self.last_error = Some(user_message.clone());
                SendOutcome::Failed { kind, user_message }
            }
        }
    }

    /// Optimistic insert, delivery and settlement in one go
    pub async fn send(&mut self, content: &str) -> SyncResult<SendOutcome> {
        let send = self.begin_send(content)?;
        let (send, result) = Self::deliver(self.api.clone(), self.config.retry.clone(), send).await;
        self.complete_send(send, result).await
    }

    /// Take in the authoritative recent messages pushed by the server
    pub fn apply_live_update(&mut self, update: LiveUpdate, now: Instant) {
        let window = self.config.match_window;
        let Some(active) = self
            .active
            .as_mut()
            .filter(|a| a.id == update.conversation_id)
        else {
            debug!(
                "Ignoring live update for inactive conversation {}",
                update.conversation_id
            );
            return;
        };

        for confirmation in reconcile(&mut active.pending, &update.messages, window) {
            debug!(
                "Optimistic message {} matched by live feed ({:?})",
                confirmation.temp_id, confirmation.kind
            );
            // A look-alike may come from another device, so only an echoed
            // token settles a send whose own result is still unknown
            if confirmation.kind == MatchKind::Token
                && self.in_flight.contains(&confirmation.temp_id)
            {
                self.confirmed.insert(confirmation.temp_id);
            }
        }
        merge_by_id(&mut active.authoritative, update.messages);
        self.queue_unread(now);
    }

    fn queue_unread(&mut self, now: Instant) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let unread: Vec<String> = active
            .authoritative
            .iter()
            .filter(|m| m.sender_id != self.user_id && !m.is_read_by(&self.user_id))
            .map(|m| m.id.clone())
            .collect();
        let added = self.receipts.queue(unread, now);
        if added > 0 {
            debug!("Queued {} messages for read receipts", added);
        }
    }

    /// When a read-receipt sweep is due, mark the open conversation read.
    /// Returns whether a sweep ran.
    pub async fn flush_read_receipts(&mut self, now: Instant) -> SyncResult<bool> {
        let Some(conversation_id) = self.active.as_ref().map(|a| a.id.clone()) else {
            return Ok(false);
        };
        let Some(batch) = self.receipts.begin(now) else {
            return Ok(false);
        };

        let api = self.api.clone();
        let result = self
            .call(api.mark_as_read(MarkReadRequest {
                conversation_id: conversation_id.clone(),
            }))
            .await;

        match result {
            Ok(_) => {
                let marked: HashSet<&String> = batch.iter().collect();
                if let Some(active) = self.active.as_mut().filter(|a| a.id == conversation_id) {
                    for message in active
                        .authoritative
                        .iter_mut()
                        .filter(|m| marked.contains(&m.id))
                    {
                        message.read_by.insert(self.user_id.clone(), true);
                    }
                }
                debug!("Marked {} read for {}", conversation_id, self.user_id);
                self.receipts.finish(batch, true, now);
                Ok(true)
            }
            Err(e) => {
                self.receipts.finish(batch, false, now);
                Err(e)
            }
        }
    }

    pub fn read_receipts(&self) -> &ReadReceiptScheduler {
        &self.receipts
    }

    pub async fn delete_message(&mut self, message_id: &str) -> SyncResult<()> {
        let conversation_id = self
            .active
            .as_ref()
            .map(|a| a.id.clone())
            .ok_or(SyncError::NoActiveConversation)?;

        let api = self.api.clone();
        self.call(api.delete_message(DeleteMessageRequest {
            conversation_id: conversation_id.clone(),
            message_id: message_id.to_string(),
        }))
        .await?;

        if let Some(message) = self
            .active
            .as_mut()
            .filter(|a| a.id == conversation_id)
            .and_then(|a| a.authoritative.iter_mut().find(|m| m.id == message_id))
        {
            message.deleted = true;
            message.content = DELETED_PLACEHOLDER.to_string();
        }
        Ok(())
    }

    pub async fn total_unread(&self) -> SyncResult<TotalUnreadResponse> {
        let api = self.api.clone();
        self.call(api.total_unread()).await
    }

    /// React to connectivity changes. Coming back online refreshes the chat
    /// list and replays failed messages of the open conversation.
    pub async fn on_network_change(&mut self, online: bool) -> SyncResult<Option<ReconnectReport>> {
        let was_online = self.online;
        self.online = online;
        if !online {
            if was_online {
                info!("{} went offline", self.user_id);
            }
            return Ok(None);
        }
        if was_online {
            return Ok(None);
        }

        info!("{} is back online, resynchronizing", self.user_id);
        if let Err(e) = self.refresh_chats(true).await {
            warn!("Chat list refresh after reconnect failed: {}", e);
        }
        self.drain_failed_queue().await.map(Some)
    }

    /// Discard expired failed messages and resend those of the open conversation
    pub async fn drain_failed_queue(&mut self) -> SyncResult<ReconnectReport> {
        let mut report = ReconnectReport {
            pruned: self
                .failed
                .prune_expired(self.config.failed_retention, now_millis())
                .await?,
            ..Default::default()
        };

        let Some(conversation_id) = self.active.as_ref().map(|a| a.id.clone()) else {
            return Ok(report);
        };

        // Entries stay in the queue until their replay has settled
        for entry in self.failed.pending_for(&conversation_id).await? {
            let send = match self.begin_send_at(&entry.content, entry.enqueued_at) {
                Ok(send) => send,
                Err(e) => {
                    warn!("Dropping unsendable failed message {}: {}", entry.id, e);
                    self.failed.remove(entry.id).await?;
                    continue;
                }
            };

            let (send, result) =
                Self::deliver(self.api.clone(), self.config.retry.clone(), send).await;
            match self.settle_send(&send, result) {
                SendOutcome::Failed { .. } => report.requeued += 1,
                _ => {
                    self.failed.remove(entry.id).await?;
                    report.replayed += 1;
                }
            }
        }

        if report.replayed > 0 || report.requeued > 0 {
            info!(
                "Replayed {} failed messages in {}, {} failed again",
                report.replayed, conversation_id, report.requeued
            );
        }
        Ok(report)
    }
}

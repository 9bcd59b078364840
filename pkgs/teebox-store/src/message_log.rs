//! Message log - append-only, sharded message storage
//!
//! Appends happen in two steps. The first transaction records the message,
//! the sender's own read receipt and a pending metadata row. The second
//! applies that metadata to the conversation (count, preview, unread
//! counters). When the second step fails the message is still stored and the
//! pending row is picked up again by the [`MetadataReconciler`].
//!
//! [`MetadataReconciler`]: crate::reconciler::MetadataReconciler

use crate::conversation_store::ConversationStore;
use crate::entities::{conversations, message_receipts, messages, pending_metadata};
use crate::error::{is_unique_violation, StoreError, StoreResult};
use crate::shard::{ShardId, ShardRouter};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::collections::{BTreeMap, HashMap};
use teebox_dm::{normalize_content, now_millis, Message, DELETED_PLACEHOLDER};
use tracing::{debug, info, warn};

/// Result of an append
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: Message,
    pub shard: ShardId,
    /// The idempotency token matched an existing message; nothing was written
    pub duplicate: bool,
    /// False when the metadata step failed and was left for the reconciler
    pub metadata_applied: bool,
}

/// What a lookup found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLookup {
    pub deleted: bool,
    pub sender_id: String,
    pub shard: ShardId,
}

#[derive(Clone)]
pub struct MessageLog {
    db: DatabaseConnection,
    router: ShardRouter,
    conversations: ConversationStore,
    max_content_length: usize,
}

impl MessageLog {
    pub fn new(
        db: DatabaseConnection,
        router: ShardRouter,
        conversations: ConversationStore,
        max_content_length: usize,
    ) -> Self {
        Self {
            db,
            router,
            conversations,
            max_content_length,
        }
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    /// Append a message from `sender_id`
    ///
    /// With an idempotency token, a message already carrying that token in
    /// the current write shard is returned instead of a new one.
    pub async fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        idempotency_token: Option<&str>,
    ) -> StoreResult<AppendOutcome> {
        let conversation = self
            .conversations
            .require_participant(conversation_id, sender_id)
            .await?;

        let content = normalize_content(content, self.max_content_length).ok_or_else(|| {
            StoreError::InvalidArgument("Message content cannot be empty".to_string())
        })?;

        let shard = self.router.write_shard(conversation.message_count);

        if let Some(token) = idempotency_token {
            if let Some(existing) = self.find_by_token(conversation_id, shard, token).await? {
                debug!(
                    "Duplicate send with token {} in {}/{}, returning {}",
                    token, conversation_id, shard, existing.id
                );
                return Ok(AppendOutcome {
                    message: existing,
                    shard,
                    duplicate: true,
                    metadata_applied: true,
                });
            }
        }

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content,
            timestamp: now_millis(),
            read_by: BTreeMap::from([(sender_id.to_string(), true)]),
            deleted: false,
            idempotency_token: idempotency_token.map(str::to_string),
        };

        match self.record(&message, shard).await {
            Ok(()) => {}
            Err(StoreError::Database(e)) if is_unique_violation(&e) => {
                // A concurrent send with the same token won the race
                if let Some(token) = idempotency_token {
                    if let Some(existing) =
                        self.find_by_token(conversation_id, shard, token).await?
                    {
                        return Ok(AppendOutcome {
                            message: existing,
                            shard,
                            duplicate: true,
                            metadata_applied: true,
                        });
                    }
                }
                return Err(StoreError::Database(e));
            }
            Err(e) => return Err(e),
        }

        let metadata_applied = match self.conversations.apply_pending(&message.id).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "Message {} stored but metadata update failed, deferring: {}",
                    message.id, e
                );
                self.conversations.note_pending_failure(&message.id).await;
                false
            }
        };

        info!(
            "Appended message {} to {}/{}",
            message.id, conversation_id, shard
        );

        Ok(AppendOutcome {
            message,
            shard,
            duplicate: false,
            metadata_applied,
        })
    }

    /// Phase one: the message, its sender receipt and the pending metadata
    async fn record(&self, message: &Message, shard: ShardId) -> StoreResult<()> {
        let txn = self.db.begin().await?;

        messages::Entity::insert(messages::ActiveModel {
            id: Set(message.id.clone()),
            conversation_id: Set(message.conversation_id.clone()),
            shard: Set(shard.as_column()),
            sender_id: Set(message.sender_id.clone()),
            content: Set(message.content.clone()),
            timestamp: Set(message.timestamp),
            deleted: Set(false),
            idempotency_token: Set(message.idempotency_token.clone()),
        })
        .exec_without_returning(&txn)
        .await?;

        message_receipts::Entity::insert(message_receipts::ActiveModel {
            message_id: Set(message.id.clone()),
            user_id: Set(message.sender_id.clone()),
            conversation_id: Set(message.conversation_id.clone()),
            shard: Set(shard.as_column()),
            read_at: Set(message.timestamp),
        })
        .exec_without_returning(&txn)
        .await?;

        pending_metadata::Entity::insert(pending_metadata::ActiveModel {
            message_id: Set(message.id.clone()),
            conversation_id: Set(message.conversation_id.clone()),
            sender_id: Set(message.sender_id.clone()),
            content: Set(message.content.clone()),
            timestamp: Set(message.timestamp),
            attempts: Set(0),
            created_at: Set(now_millis()),
        })
        .exec_without_returning(&txn)
        .await?;

        txn.commit().await?;
        Ok(())
    }

    async fn find_by_token(
        &self,
        conversation_id: &str,
        shard: ShardId,
        token: &str,
    ) -> StoreResult<Option<Message>> {
        let model = messages::Entity::find()
            .filter(messages::Column::ConversationId.eq(conversation_id))
            .filter(messages::Column::Shard.eq(shard.as_column()))
            .filter(messages::Column::IdempotencyToken.eq(token))
            .one(&self.db)
            .await?;

        match model {
            Some(model) => Ok(Some(load_one(&self.db, model).await?)),
            None => Ok(None),
        }
    }

    /// Find a message by walking shards from newest to the default shard
    pub(crate) async fn locate(
        &self,
        conversation: &conversations::Model,
        message_id: &str,
    ) -> StoreResult<Option<messages::Model>> {
        for shard in self.router.newest_first(conversation.message_count) {
            let found = messages::Entity::find()
                .filter(messages::Column::ConversationId.eq(&conversation.id))
                .filter(messages::Column::Shard.eq(shard.as_column()))
                .filter(messages::Column::Id.eq(message_id))
                .one(&self.db)
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Read-only lookup with the same bounded shard scan as deletion
    pub async fn exists(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> StoreResult<Option<MessageLookup>> {
        let conversation = self.conversations.require(conversation_id).await?;
        Ok(self
            .locate(&conversation, message_id)
            .await?
            .map(|m| MessageLookup {
                deleted: m.deleted,
                sender_id: m.sender_id,
                shard: ShardId(m.shard.max(0) as u32),
            }))
    }

    /// Soft-delete a message. Only its sender may do this; repeating it is a no-op.
    pub async fn soft_delete(
        &self,
        conversation_id: &str,
        message_id: &str,
        requesting_user_id: &str,
    ) -> StoreResult<()> {
        let conversation = self.conversations.require(conversation_id).await?;
        let message = self
            .locate(&conversation, message_id)
            .await?
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        if message.sender_id != requesting_user_id {
            return Err(StoreError::NotSender(message_id.to_string()));
        }
        if message.deleted {
            debug!("Message {} already deleted", message_id);
            return Ok(());
        }

        let txn = self.db.begin().await?;
        messages::Entity::update_many()
            .col_expr(messages::Column::Deleted, Expr::value(true))
            .col_expr(
                messages::Column::Content,
                Expr::value(DELETED_PLACEHOLDER.to_string()),
            )
            .filter(messages::Column::Id.eq(message_id))
            .filter(messages::Column::Deleted.eq(false))
            .exec(&txn)
            .await?;
        ConversationStore::replace_preview_content(
            &txn,
            conversation_id,
            message_id,
            DELETED_PLACEHOLDER,
        )
        .await?;
        txn.commit().await?;

        info!("Soft-deleted message {} in {}", message_id, conversation_id);
        Ok(())
    }
}

/// Readers of each message, keyed by message id
pub(crate) async fn load_read_by<C: ConnectionTrait>(
    db: &C,
    message_ids: &[String],
) -> StoreResult<HashMap<String, BTreeMap<String, bool>>> {
    let mut read_by: HashMap<String, BTreeMap<String, bool>> = HashMap::new();
    if message_ids.is_empty() {
        return Ok(read_by);
    }

    let receipts = message_receipts::Entity::find()
        .filter(message_receipts::Column::MessageId.is_in(message_ids.iter().cloned()))
        .all(db)
        .await?;
    for receipt in receipts {
        read_by
            .entry(receipt.message_id)
            .or_default()
            .insert(receipt.user_id, true);
    }
    Ok(read_by)
}

pub(crate) fn to_message(model: messages::Model, read_by: BTreeMap<String, bool>) -> Message {
    Message {
        id: model.id,
        conversation_id: model.conversation_id,
        sender_id: model.sender_id,
        content: model.content,
        timestamp: model.timestamp,
        read_by,
        deleted: model.deleted,
        idempotency_token: model.idempotency_token,
    }
}

/// Attach read receipts to a batch of rows, keeping their order
pub(crate) async fn load_messages<C: ConnectionTrait>(
    db: &C,
    models: Vec<messages::Model>,
) -> StoreResult<Vec<Message>> {
    let ids: Vec<String> = models.iter().map(|m| m.id.clone()).collect();
    let mut read_by = load_read_by(db, &ids).await?;
    Ok(models
        .into_iter()
        .map(|m| {
            let readers = read_by.remove(&m.id).unwrap_or_default();
            to_message(m, readers)
        })
        .collect())
}

async fn load_one<C: ConnectionTrait>(db: &C, model: messages::Model) -> StoreResult<Message> {
    let readers = load_read_by(db, std::slice::from_ref(&model.id))
        .await?
        .remove(&model.id)
        .unwrap_or_default();
    Ok(to_message(model, readers))
}

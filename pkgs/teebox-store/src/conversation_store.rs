//! Conversation store - participants, unread counters and preview metadata

use crate::entities::{conversation_participants, conversations, pending_metadata, unread_counters};
use crate::error::{is_unique_violation, StoreError, StoreResult};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use teebox_dm::{
    now_millis, truncate_chars, ConversationSummary, MessagePreview, TotalUnreadResponse,
    PREVIEW_LENGTH,
};
use tracing::{debug, info, warn};

/// Conversation store
#[derive(Clone)]
pub struct ConversationStore {
    db: DatabaseConnection,
}

impl ConversationStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Deterministic id for the 1:1 chat between two users
    pub fn direct_conversation_id(a: &str, b: &str) -> String {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha256::new();
        hasher.update(first.as_bytes());
        hasher.update([0u8]);
        hasher.update(second.as_bytes());
        format!("dm_{:x}", hasher.finalize())
    }

    /// Return the 1:1 chat between `user_id` and `peer_id`, creating it on first contact
    pub async fn get_or_create_direct(
        &self,
        user_id: &str,
        peer_id: &str,
    ) -> StoreResult<ConversationSummary> {
        if user_id == peer_id {
            return Err(StoreError::InvalidArgument(
                "Cannot start a chat with yourself".to_string(),
            ));
        }

        let id = Self::direct_conversation_id(user_id, peer_id);

        if self.find(&id).await?.is_some() {
            // Re-opening a chat brings it back from the archive
            conversation_participants::Entity::update_many()
                .col_expr(conversation_participants::Column::Archived, Expr::value(false))
                .filter(conversation_participants::Column::ConversationId.eq(&id))
                .filter(conversation_participants::Column::UserId.eq(user_id))
                .exec(&self.db)
                .await?;
            debug!("Reusing direct conversation {}", id);
            return self.summary(&id).await;
        }

        match self
            .insert_conversation(&id, false, user_id, &[user_id.to_string(), peer_id.to_string()])
            .await
        {
            Ok(()) => info!("Created direct conversation {}", id),
            Err(StoreError::Database(e)) if is_unique_violation(&e) => {
                // Another request created it concurrently
                info!("Direct conversation '{}' already exists, treating as success", id);
            }
            Err(e) => return Err(e),
        }

        self.summary(&id).await
    }

    /// Create a group chat. The creator is always the first participant.
    pub async fn create_group(
        &self,
        creator_id: &str,
        members: &[String],
    ) -> StoreResult<ConversationSummary> {
        let mut participants = vec![creator_id.to_string()];
        for member in members {
            if !participants.contains(member) {
                participants.push(member.clone());
            }
        }
        if participants.len() < 2 {
            return Err(StoreError::InvalidArgument(
                "A group needs at least one other member".to_string(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.insert_conversation(&id, true, creator_id, &participants)
            .await?;
        info!(
            "Created group conversation {} with {} participants",
            id,
            participants.len()
        );

        self.summary(&id).await
    }

    async fn insert_conversation(
        &self,
        id: &str,
        is_group: bool,
        created_by: &str,
        participants: &[String],
    ) -> StoreResult<()> {
        let now = now_millis();
        let txn = self.db.begin().await?;

        conversations::Entity::insert(conversations::ActiveModel {
            id: Set(id.to_string()),
            is_group: Set(is_group),
            created_by: Set(created_by.to_string()),
            message_count: Set(0),
            last_message_content: Set(None),
            last_message_sender_id: Set(None),
            last_message_id: Set(None),
            last_message_timestamp: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .exec_without_returning(&txn)
        .await?;

        let members = participants
            .iter()
            .enumerate()
            .map(|(position, user_id)| conversation_participants::ActiveModel {
                conversation_id: Set(id.to_string()),
                user_id: Set(user_id.clone()),
                position: Set(position as i32),
                active: Set(true),
                archived: Set(false),
                joined_at: Set(now),
                left_at: Set(None),
            });
        conversation_participants::Entity::insert_many(members)
            .exec_without_returning(&txn)
            .await?;

        let counters = participants
            .iter()
            .map(|user_id| unread_counters::ActiveModel {
                conversation_id: Set(id.to_string()),
                user_id: Set(user_id.clone()),
                count: Set(0),
            });
        unread_counters::Entity::insert_many(counters)
            .exec_without_returning(&txn)
            .await?;

        txn.commit().await?;
        Ok(())
    }

    /// Add a member to a group, or re-activate a former member
    pub async fn add_participant(&self, conversation_id: &str, user_id: &str) -> StoreResult<()> {
        let conversation = self.require(conversation_id).await?;
        if !conversation.is_group {
            return Err(StoreError::InvalidArgument(
                "Direct chats have a fixed participant pair".to_string(),
            ));
        }

        let existing = conversation_participants::Entity::find_by_id((
            conversation_id.to_string(),
            user_id.to_string(),
        ))
        .one(&self.db)
        .await?;

        if let Some(model) = existing {
            let mut active: conversation_participants::ActiveModel = model.into();
            active.active = Set(true);
            active.left_at = Set(None);
            active.update(&self.db).await?;
        } else {
            let position = self.participant_models(conversation_id).await?.len() as i32;
            conversation_participants::Entity::insert(conversation_participants::ActiveModel {
                conversation_id: Set(conversation_id.to_string()),
                user_id: Set(user_id.to_string()),
                position: Set(position),
                active: Set(true),
                archived: Set(false),
                joined_at: Set(now_millis()),
                left_at: Set(None),
            })
            .exec_without_returning(&self.db)
            .await?;
        }

        info!("Added {} to group {}", user_id, conversation_id);
        Ok(())
    }

    /// Remove a member from a group. The unread counter row is kept.
    pub async fn remove_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> StoreResult<()> {
        let conversation = self.require(conversation_id).await?;
        if !conversation.is_group {
            return Err(StoreError::InvalidArgument(
                "Direct chats can be archived but not left".to_string(),
            ));
        }

        let result = conversation_participants::Entity::update_many()
            .col_expr(conversation_participants::Column::Active, Expr::value(false))
            .col_expr(
                conversation_participants::Column::LeftAt,
                Expr::value(now_millis()),
            )
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .filter(conversation_participants::Column::Active.eq(true))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotParticipant {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        info!("Removed {} from group {}", user_id, conversation_id);
        Ok(())
    }

    /// Hide a conversation from one participant's chat list
    pub async fn archive(&self, conversation_id: &str, user_id: &str) -> StoreResult<()> {
        let result = conversation_participants::Entity::update_many()
            .col_expr(conversation_participants::Column::Archived, Expr::value(true))
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotParticipant {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn find(&self, conversation_id: &str) -> StoreResult<Option<conversations::Model>> {
        Ok(conversations::Entity::find_by_id(conversation_id.to_string())
            .one(&self.db)
            .await?)
    }

    pub async fn require(&self, conversation_id: &str) -> StoreResult<conversations::Model> {
        self.find(conversation_id)
            .await?
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))
    }

    /// Load the conversation and check `user_id` may act in it
    pub async fn require_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> StoreResult<conversations::Model> {
        let conversation = self.require(conversation_id).await?;
        let participant = conversation_participants::Entity::find_by_id((
            conversation_id.to_string(),
            user_id.to_string(),
        ))
        .one(&self.db)
        .await?;

        match participant {
            Some(p) if p.active => Ok(conversation),
            _ => Err(StoreError::NotParticipant {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
            }),
        }
    }

    async fn participant_models(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<conversation_participants::Model>> {
        Ok(conversation_participants::Entity::find()
            .filter(conversation_participants::Column::ConversationId.eq(conversation_id))
            .order_by_asc(conversation_participants::Column::Position)
            .all(&self.db)
            .await?)
    }

    /// Active participants in join order
    pub async fn participants(&self, conversation_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .participant_models(conversation_id)
            .await?
            .into_iter()
            .filter(|p| p.active)
            .map(|p| p.user_id)
            .collect())
    }

    pub async fn summary(&self, conversation_id: &str) -> StoreResult<ConversationSummary> {
        let conversation = self.require(conversation_id).await?;
        self.build_summary(conversation).await
    }

    async fn build_summary(
        &self,
        model: conversations::Model,
    ) -> StoreResult<ConversationSummary> {
        let participants = self.participants(&model.id).await?;
        let unread_counters: BTreeMap<String, i64> = unread_counters::Entity::find()
            .filter(unread_counters::Column::ConversationId.eq(&model.id))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|c| (c.user_id, c.count))
            .collect();

        let last_message_preview = match (
            model.last_message_id,
            model.last_message_content,
            model.last_message_sender_id,
            model.last_message_timestamp,
        ) {
            (Some(message_id), Some(content), Some(sender_id), Some(timestamp)) => {
                Some(MessagePreview {
                    content,
                    sender_id,
                    message_id,
                    timestamp,
                })
            }
            _ => None,
        };

        Ok(ConversationSummary {
            id: model.id,
            participants,
            is_group: model.is_group,
            message_count: model.message_count,
            unread_counters,
            last_message_preview,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }

    /// Chats visible to `user_id`, most recently active first
    pub async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<ConversationSummary>> {
        let memberships = conversation_participants::Entity::find()
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .filter(conversation_participants::Column::Active.eq(true))
            .filter(conversation_participants::Column::Archived.eq(false))
            .all(&self.db)
            .await?;
        let ids: Vec<String> = memberships.into_iter().map(|m| m.conversation_id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let models = conversations::Entity::find()
            .filter(conversations::Column::Id.is_in(ids))
            .order_by_desc(conversations::Column::UpdatedAt)
            .all(&self.db)
            .await?;

        let mut summaries = Vec::with_capacity(models.len());
        for model in models {
            summaries.push(self.build_summary(model).await?);
        }
        Ok(summaries)
    }

    /// Unread totals across every conversation `user_id` belongs to
    pub async fn total_unread(&self, user_id: &str) -> StoreResult<TotalUnreadResponse> {
        let memberships: Vec<String> = conversation_participants::Entity::find()
            .filter(conversation_participants::Column::UserId.eq(user_id))
            .filter(conversation_participants::Column::Active.eq(true))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| m.conversation_id)
            .collect();
        if memberships.is_empty() {
            return Ok(TotalUnreadResponse::default());
        }

        let counters = unread_counters::Entity::find()
            .filter(unread_counters::Column::UserId.eq(user_id))
            .filter(unread_counters::Column::ConversationId.is_in(memberships))
            .filter(unread_counters::Column::Count.gt(0))
            .all(&self.db)
            .await?;

        let mut response = TotalUnreadResponse::default();
        for counter in counters {
            response.total_unread += counter.count;
            response
                .unread_by_chat
                .insert(counter.conversation_id, counter.count);
        }
        Ok(response)
    }

    /// Zero one participant's unread counter
    pub async fn reset_unread(&self, conversation_id: &str, user_id: &str) -> StoreResult<()> {
        unread_counters::Entity::insert(unread_counters::ActiveModel {
            conversation_id: Set(conversation_id.to_string()),
            user_id: Set(user_id.to_string()),
            count: Set(0),
        })
        .on_conflict(
            OnConflict::columns([
                unread_counters::Column::ConversationId,
                unread_counters::Column::UserId,
            ])
            .update_column(unread_counters::Column::Count)
            .to_owned(),
        )
        .exec_without_returning(&self.db)
        .await?;
        Ok(())
    }

    /// Apply the metadata recorded for `message_id`: message count, preview,
    /// unread counters. Returns false when it was already applied.
    ///
    /// The pending row is deleted in the same transaction as the counter
    /// updates, so replays never double count.
    pub async fn apply_pending(&self, message_id: &str) -> StoreResult<bool> {
        let txn = self.db.begin().await?;

        let Some(pending) = pending_metadata::Entity::find_by_id(message_id.to_string())
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(false);
        };

        // Re-read participants: membership may have changed since the append
        let participants: Vec<String> = conversation_participants::Entity::find()
            .filter(conversation_participants::Column::ConversationId.eq(&pending.conversation_id))
            .filter(conversation_participants::Column::Active.eq(true))
            .all(&txn)
            .await?
            .into_iter()
            .map(|p| p.user_id)
            .collect();

        ensure_counters(&txn, &pending.conversation_id, &participants).await?;

        let now = now_millis();
        conversations::Entity::update_many()
            .col_expr(
                conversations::Column::MessageCount,
                Expr::col(conversations::Column::MessageCount).add(1),
            )
            .col_expr(conversations::Column::UpdatedAt, Expr::value(now))
            .filter(conversations::Column::Id.eq(&pending.conversation_id))
            .exec(&txn)
            .await?;

        // A late replay must not overwrite a newer preview
        conversations::Entity::update_many()
            .col_expr(
                conversations::Column::LastMessageContent,
                Expr::value(truncate_chars(&pending.content, PREVIEW_LENGTH)),
            )
            .col_expr(
                conversations::Column::LastMessageSenderId,
                Expr::value(pending.sender_id.clone()),
            )
            .col_expr(
                conversations::Column::LastMessageId,
                Expr::value(pending.message_id.clone()),
            )
            .col_expr(
                conversations::Column::LastMessageTimestamp,
                Expr::value(pending.timestamp),
            )
            .filter(conversations::Column::Id.eq(&pending.conversation_id))
            .filter(
                Condition::any()
                    .add(conversations::Column::LastMessageTimestamp.is_null())
                    .add(conversations::Column::LastMessageTimestamp.lte(pending.timestamp)),
            )
            .exec(&txn)
            .await?;

        let recipients: Vec<String> = participants
            .iter()
            .filter(|p| **p != pending.sender_id)
            .cloned()
            .collect();
        if !recipients.is_empty() {
            unread_counters::Entity::update_many()
                .col_expr(
                    unread_counters::Column::Count,
                    Expr::col(unread_counters::Column::Count).add(1),
                )
                .filter(unread_counters::Column::ConversationId.eq(&pending.conversation_id))
                .filter(unread_counters::Column::UserId.is_in(recipients))
                .exec(&txn)
                .await?;
        }

        // The sender never sees their own message as unread
        unread_counters::Entity::update_many()
            .col_expr(unread_counters::Column::Count, Expr::value(0i64))
            .filter(unread_counters::Column::ConversationId.eq(&pending.conversation_id))
            .filter(unread_counters::Column::UserId.eq(&pending.sender_id))
            .exec(&txn)
            .await?;

        pending_metadata::Entity::delete_by_id(pending.message_id.clone())
            .exec(&txn)
            .await?;

        txn.commit().await?;
        debug!(
            "Applied metadata for message {} in {}",
            pending.message_id, pending.conversation_id
        );
        Ok(true)
    }

    /// Record a failed metadata attempt so the reconciler can report on it
    pub async fn note_pending_failure(&self, message_id: &str) {
        let result = pending_metadata::Entity::update_many()
            .col_expr(
                pending_metadata::Column::Attempts,
                Expr::col(pending_metadata::Column::Attempts).add(1),
            )
            .filter(pending_metadata::Column::MessageId.eq(message_id))
            .exec(&self.db)
            .await;
        if let Err(e) = result {
            warn!("Failed to record metadata attempt for {}: {}", message_id, e);
        }
    }

    /// Replace the preview text when it shows `message_id`
    pub(crate) async fn replace_preview_content<C: ConnectionTrait>(
        db: &C,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> StoreResult<()> {
        conversations::Entity::update_many()
            .col_expr(
                conversations::Column::LastMessageContent,
                Expr::value(content.to_string()),
            )
            .col_expr(conversations::Column::UpdatedAt, Expr::value(now_millis()))
            .filter(conversations::Column::Id.eq(conversation_id))
            .filter(conversations::Column::LastMessageId.eq(message_id))
            .exec(db)
            .await?;
        Ok(())
    }
}

/// Create zeroed counters for participants that have none yet
async fn ensure_counters<C: ConnectionTrait>(
    db: &C,
    conversation_id: &str,
    participants: &[String],
) -> StoreResult<()> {
    if participants.is_empty() {
        return Ok(());
    }

    let rows = participants.iter().map(|user_id| unread_counters::ActiveModel {
        conversation_id: Set(conversation_id.to_string()),
        user_id: Set(user_id.clone()),
        count: Set(0),
    });
    unread_counters::Entity::insert_many(rows)
        .on_conflict(
            OnConflict::columns([
                unread_counters::Column::ConversationId,
                unread_counters::Column::UserId,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_id_is_order_independent() {
        let ab = ConversationStore::direct_conversation_id("alice", "bob");
        let ba = ConversationStore::direct_conversation_id("bob", "alice");
        assert_eq!(ab, ba);
        assert!(ab.starts_with("dm_"));
    }

    #[test]
    fn test_direct_id_separates_ambiguous_pairs() {
        let one = ConversationStore::direct_conversation_id("ab", "c");
        let two = ConversationStore::direct_conversation_id("a", "bc");
        assert_ne!(one, two);
    }
}

//! Read-receipt batch updater
//!
//! Marks every message in a conversation as read for one participant. Each
//! shard is swept independently and the sweeps run concurrently with a
//! bounded fan-out. A failed shard is reported, not rolled back: receipts
//! only ever move from unread to read, so calling again finishes the job.

use crate::conversation_store::ConversationStore;
use crate::entities::{message_receipts, messages};
use crate::error::StoreResult;
use crate::shard::{ShardId, ShardRouter};
use futures::stream::{self, StreamExt};
use sea_orm::sea_query::{OnConflict, Query};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set};
use teebox_dm::now_millis;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkReadReport {
    pub shards_scanned: u32,
    pub messages_marked: u64,
    pub failed_shards: Vec<ShardId>,
}

#[derive(Clone)]
pub struct ReadReceiptUpdater {
    db: DatabaseConnection,
    router: ShardRouter,
    conversations: ConversationStore,
    batch_cap: u64,
    fanout: usize,
}

impl ReadReceiptUpdater {
    pub fn new(
        db: DatabaseConnection,
        router: ShardRouter,
        conversations: ConversationStore,
        batch_cap: u64,
        fanout: usize,
    ) -> Self {
        Self {
            db,
            router,
            conversations,
            batch_cap: batch_cap.max(1),
            fanout: fanout.max(1),
        }
    }

    /// Mark everything in `conversation_id` read for `user_id`, then zero
    /// their unread counter
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> StoreResult<MarkReadReport> {
        let conversation = self
            .conversations
            .require_participant(conversation_id, user_id)
            .await?;

        let shards: Vec<ShardId> = self.router.newest_first(conversation.message_count).collect();
        let mut report = MarkReadReport {
            shards_scanned: shards.len() as u32,
            ..Default::default()
        };

        let results: Vec<(ShardId, StoreResult<u64>)> = stream::iter(shards)
            .map(|shard| async move {
                (shard, self.mark_shard(conversation_id, shard, user_id).await)
            })
            .buffer_unordered(self.fanout)
            .collect()
            .await;

        for (shard, result) in results {
            match result {
                Ok(marked) => report.messages_marked += marked,
                Err(e) => {
                    warn!(
                        "Read receipts for {}/{} failed, will retry on next call: {}",
                        conversation_id, shard, e
                    );
                    report.failed_shards.push(shard);
                }
            }
        }

        self.conversations
            .reset_unread(conversation_id, user_id)
            .await?;

        info!(
            "Marked {} messages read for {} in {} ({} shards)",
            report.messages_marked, user_id, conversation_id, report.shards_scanned
        );
        Ok(report)
    }

    /// Sweep one shard in batches of at most `batch_cap`
    async fn mark_shard(
        &self,
        conversation_id: &str,
        shard: ShardId,
        user_id: &str,
    ) -> StoreResult<u64> {
        let mut marked = 0u64;

        loop {
            let already_read = Query::select()
                .column(message_receipts::Column::MessageId)
                .from(message_receipts::Entity)
                .and_where(message_receipts::Column::ConversationId.eq(conversation_id))
                .and_where(message_receipts::Column::Shard.eq(shard.as_column()))
                .and_where(message_receipts::Column::UserId.eq(user_id))
                .to_owned();

            let unread: Vec<String> = messages::Entity::find()
                .select_only()
                .column(messages::Column::Id)
                .filter(messages::Column::ConversationId.eq(conversation_id))
                .filter(messages::Column::Shard.eq(shard.as_column()))
                .filter(messages::Column::Id.not_in_subquery(already_read))
                .limit(self.batch_cap)
                .into_tuple()
                .all(&self.db)
                .await?;

            if unread.is_empty() {
                break;
            }

            let count = unread.len() as u64;
            let read_at = now_millis();
            let receipts = unread.into_iter().map(|message_id| message_receipts::ActiveModel {
                message_id: Set(message_id),
                user_id: Set(user_id.to_string()),
                conversation_id: Set(conversation_id.to_string()),
                shard: Set(shard.as_column()),
                read_at: Set(read_at),
            });

            message_receipts::Entity::insert_many(receipts)
                .on_conflict(
                    OnConflict::columns([
                        message_receipts::Column::MessageId,
                        message_receipts::Column::UserId,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(&self.db)
                .await?;

            marked += count;
            debug!("Marked batch of {} in {}/{}", count, conversation_id, shard);

            if count < self.batch_cap {
                break;
            }
        }

        Ok(marked)
    }
}

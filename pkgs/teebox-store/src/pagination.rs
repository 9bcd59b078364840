//! Pagination across shard boundaries
//!
//! Pages are read newest-first, walking from the write shard towards the
//! default shard and topping up from older shards until the page is full.
//! Within a shard rows are ordered by `(timestamp, id)` so messages sharing
//! a millisecond are neither skipped nor repeated between pages. Shards are
//! disjoint, so the cursor bound only applies inside the cursor's own shard.

use crate::conversation_store::ConversationStore;
use crate::entities::messages;
use crate::error::StoreResult;
use crate::message_log::{load_messages, MessageLog};
use crate::shard::{ShardId, ShardRouter};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use teebox_dm::PageResponse;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Paginator {
    db: DatabaseConnection,
    router: ShardRouter,
    conversations: ConversationStore,
    log: MessageLog,
}

/// Position strictly after which older messages are read
struct Boundary {
    timestamp: i64,
    id: String,
}

impl Paginator {
    pub fn new(
        db: DatabaseConnection,
        router: ShardRouter,
        conversations: ConversationStore,
        log: MessageLog,
    ) -> Self {
        Self {
            db,
            router,
            conversations,
            log,
        }
    }

    /// Up to `page_size` messages older than `cursor_message_id` (or the most
    /// recent ones without a cursor), returned oldest first
    pub async fn page(
        &self,
        conversation_id: &str,
        page_size: u64,
        cursor_message_id: Option<&str>,
    ) -> StoreResult<PageResponse> {
        let conversation = self.conversations.require(conversation_id).await?;
        let newest = self.router.write_shard(conversation.message_count);

        let (start, boundary) = match cursor_message_id {
            None => (newest, None),
            Some(cursor) => match self.log.locate(&conversation, cursor).await? {
                Some(found) => (
                    ShardId(found.shard.max(0) as u32),
                    Some(Boundary {
                        timestamp: found.timestamp,
                        id: found.id,
                    }),
                ),
                None => {
                    warn!(
                        "Cursor {} not found in {}, reading from the newest messages",
                        cursor, conversation_id
                    );
                    (newest, None)
                }
            },
        };

        if page_size == 0 {
            return Ok(PageResponse {
                messages: Vec::new(),
                total_count: conversation.message_count,
                last_processed_index: start.index(),
                has_more: false,
            });
        }

        // One extra row tells us whether anything older remains
        let wanted = page_size + 1;
        let mut collected: Vec<messages::Model> = Vec::new();

        for shard in self.router.shards_from(start) {
            let remaining = wanted - collected.len() as u64;
            let mut query = messages::Entity::find()
                .filter(messages::Column::ConversationId.eq(conversation_id))
                .filter(messages::Column::Shard.eq(shard.as_column()));
            if let Some(b) = boundary.as_ref().filter(|_| shard == start) {
                query = query.filter(
                    Condition::any()
                        .add(messages::Column::Timestamp.lt(b.timestamp))
                        .add(
                            Condition::all()
                                .add(messages::Column::Timestamp.eq(b.timestamp))
                                .add(messages::Column::Id.lt(b.id.as_str())),
                        ),
                );
            }

            let batch = query
                .order_by_desc(messages::Column::Timestamp)
                .order_by_desc(messages::Column::Id)
                .limit(remaining)
                .all(&self.db)
                .await?;

            debug!(
                "Read {} messages from {}/{}",
                batch.len(),
                conversation_id,
                shard
            );
            collected.extend(batch);
            if collected.len() as u64 >= wanted {
                break;
            }
        }

        let has_more = collected.len() as u64 > page_size;
        collected.truncate(page_size as usize);

        let last_processed_index = collected
            .last()
            .map(|m| m.shard.max(0) as u32)
            .unwrap_or(start.index());

        let mut page = load_messages(&self.db, collected).await?;
        page.reverse();

        Ok(PageResponse {
            messages: page,
            total_count: conversation.message_count,
            last_processed_index,
            has_more,
        })
    }
}

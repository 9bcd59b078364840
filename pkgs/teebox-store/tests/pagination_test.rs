// Tests for paging across shard boundaries

use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use tempfile::NamedTempFile;
use teebox_dm::Message;
use teebox_store::entities::{conversations, messages};
use teebox_store::{DmStore, ShardRouter, StoreConfig};

async fn create_test_store(path: &NamedTempFile, shard_size: u64, max_shards: u32) -> DmStore {
    DmStore::open(StoreConfig {
        db_path: path.path().to_path_buf(),
        shard_size,
        max_shards,
        ..Default::default()
    })
    .await
    .expect("Failed to open store")
}

async fn new_chat(store: &DmStore) -> String {
    store
        .conversations()
        .get_or_create_direct("alice", "bob")
        .await
        .unwrap()
        .id
}

/// Append `count` messages through the regular write path
async fn send_many(store: &DmStore, conversation_id: &str, count: usize) {
    for i in 0..count {
        let sender = if i % 2 == 0 { "alice" } else { "bob" };
        store
            .messages()
            .append(conversation_id, sender, &format!("message {}", i), None)
            .await
            .unwrap();
    }
}

/// Bulk-load `count` messages straight into their shards, three per millisecond
async fn seed_messages(store: &DmStore, conversation_id: &str, count: usize) {
    let router = store.router();
    let rows: Vec<messages::ActiveModel> = (0..count)
        .map(|i| messages::ActiveModel {
            id: Set(format!("seed-{:05}", (i * 7919) % 100_000)),
            conversation_id: Set(conversation_id.to_string()),
            shard: Set(router.shard_for(i as i64).as_column()),
            sender_id: Set(if i % 2 == 0 { "alice" } else { "bob" }.to_string()),
            content: Set(format!("seeded {}", i)),
            timestamp: Set(1_700_000_000_000 + (i / 3) as i64),
            deleted: Set(false),
            idempotency_token: Set(None),
        })
        .collect();
    for chunk in rows.chunks(200) {
        messages::Entity::insert_many(chunk.to_vec())
            .exec_without_returning(store.db())
            .await
            .unwrap();
    }
    conversations::Entity::update_many()
        .col_expr(conversations::Column::MessageCount, Expr::value(count as i64))
        .filter(conversations::Column::Id.eq(conversation_id))
        .exec(store.db())
        .await
        .unwrap();
}

/// The full history in `(shard, timestamp, id)` order, read directly
async fn history(store: &DmStore, conversation_id: &str) -> Vec<String> {
    messages::Entity::find()
        .filter(messages::Column::ConversationId.eq(conversation_id))
        .order_by_asc(messages::Column::Shard)
        .order_by_asc(messages::Column::Timestamp)
        .order_by_asc(messages::Column::Id)
        .all(store.db())
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect()
}

/// Walk every page from newest to oldest and rebuild chronological order
async fn read_all_pages(store: &DmStore, conversation_id: &str, page_size: u64) -> Vec<Message> {
    let mut newest_first: Vec<Message> = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = store
            .pages()
            .page(conversation_id, page_size, cursor.as_deref())
            .await
            .unwrap();
        assert!(page.messages.len() as u64 <= page_size);
        if page.messages.is_empty() {
            assert!(!page.has_more);
            break;
        }

        // Pages come back oldest first
        for pair in page.messages.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }

        cursor = Some(page.messages[0].id.clone());
        let has_more = page.has_more;
        newest_first.extend(page.messages.into_iter().rev());
        if !has_more {
            break;
        }
    }

    newest_first.reverse();
    newest_first
}

async fn assert_complete_partition(store: &DmStore, conversation_id: &str, page_size: u64) {
    let expected = history(store, conversation_id).await;
    let paged: Vec<String> = read_all_pages(store, conversation_id, page_size)
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(paged, expected, "page size {}", page_size);
}

#[tokio::test]
async fn test_pages_partition_history_across_sizes() {
    let shard_size = 10;
    for count in [0usize, 1, shard_size - 1, shard_size, shard_size * 3 + 7] {
        let temp_file = NamedTempFile::new().unwrap();
        let store = create_test_store(&temp_file, shard_size as u64, 20).await;
        let chat = new_chat(&store).await;
        send_many(&store, &chat, count).await;

        assert_eq!(history(&store, &chat).await.len(), count);
        for page_size in [1, 7, 10, 30] {
            assert_complete_partition(&store, &chat, page_size).await;
        }
    }
}

#[tokio::test]
async fn test_pages_partition_large_history_with_default_shards() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file, 500, 20).await;
    let chat = new_chat(&store).await;
    seed_messages(&store, &chat, 500 * 3 + 7).await;

    let paged = read_all_pages(&store, &chat, 30).await;
    assert_eq!(paged.len(), 1507);
    assert_complete_partition(&store, &chat, 100).await;
}

#[tokio::test]
async fn test_pages_partition_beyond_capped_shard() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file, 5, 3).await;
    let chat = new_chat(&store).await;
    seed_messages(&store, &chat, 42).await;

    // Everything past index 10 piles into the last shard
    let router = ShardRouter::new(5, 3);
    assert_eq!(router.write_shard(42).index(), 2);
    assert_complete_partition(&store, &chat, 4).await;
}

#[tokio::test]
async fn test_empty_conversation_page() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file, 500, 20).await;
    let chat = new_chat(&store).await;

    let page = store.pages().page(&chat, 30, None).await.unwrap();
    assert!(page.messages.is_empty());
    assert_eq!(page.total_count, 0);
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_cursor_at_oldest_message_is_empty() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file, 4, 20).await;
    let chat = new_chat(&store).await;
    send_many(&store, &chat, 9).await;

    let oldest = history(&store, &chat).await[0].clone();
    let page = store.pages().page(&chat, 30, Some(&oldest)).await.unwrap();
    assert!(page.messages.is_empty());
    assert!(!page.has_more);
    assert_eq!(page.total_count, 9);
}

#[tokio::test]
async fn test_first_page_reports_more_and_shard_progress() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file, 10, 20).await;
    let chat = new_chat(&store).await;
    send_many(&store, &chat, 25).await;

    let page = store.pages().page(&chat, 12, None).await.unwrap();
    assert_eq!(page.messages.len(), 12);
    assert!(page.has_more);
    assert_eq!(page.total_count, 25);
    // Messages 13..25 span shards 2 and 1
    assert_eq!(page.last_processed_index, 1);

    let all = history(&store, &chat).await;
    let ids: Vec<String> = page.messages.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, all[13..].to_vec());
}

#[tokio::test]
async fn test_unknown_cursor_falls_back_to_latest() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file, 10, 20).await;
    let chat = new_chat(&store).await;
    send_many(&store, &chat, 5).await;

    let latest = store.pages().page(&chat, 3, None).await.unwrap();
    let fallback = store
        .pages()
        .page(&chat, 3, Some("does-not-exist"))
        .await
        .unwrap();

    let latest_ids: Vec<&String> = latest.messages.iter().map(|m| &m.id).collect();
    let fallback_ids: Vec<&String> = fallback.messages.iter().map(|m| &m.id).collect();
    assert_eq!(latest_ids, fallback_ids);
}

#[tokio::test]
async fn test_page_includes_message_with_lagging_metadata() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file, 10, 20).await;
    let chat = new_chat(&store).await;
    send_many(&store, &chat, 10).await;

    // Stored in shard 1 but the count still says 10
    messages::Entity::insert(messages::ActiveModel {
        id: Set("lagging".to_string()),
        conversation_id: Set(chat.clone()),
        shard: Set(1),
        sender_id: Set("bob".to_string()),
        content: Set("count not bumped yet".to_string()),
        timestamp: Set(i64::MAX / 2),
        deleted: Set(false),
        idempotency_token: Set(None),
    })
    .exec_without_returning(store.db())
    .await
    .unwrap();

    let page = store.pages().page(&chat, 5, None).await.unwrap();
    assert_eq!(page.messages.last().unwrap().id, "lagging");
    assert_eq!(page.total_count, 10);
}

#[tokio::test]
async fn test_page_carries_read_receipts() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file, 10, 20).await;
    let chat = new_chat(&store).await;
    send_many(&store, &chat, 3).await;

    let page = store.pages().page(&chat, 30, None).await.unwrap();
    for message in &page.messages {
        assert!(message.is_read_by(&message.sender_id));
    }
}

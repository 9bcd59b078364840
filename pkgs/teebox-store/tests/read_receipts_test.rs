// Tests for the read-receipt batch updater

use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use tempfile::NamedTempFile;
use teebox_store::entities::message_receipts;
use teebox_store::{DmStore, StoreConfig, StoreError};

async fn create_test_store(path: &NamedTempFile) -> DmStore {
    DmStore::open(StoreConfig {
        db_path: path.path().to_path_buf(),
        shard_size: 10,
        read_batch_cap: 3,
        read_fanout: 2,
        ..Default::default()
    })
    .await
    .expect("Failed to open store")
}

#[tokio::test]
async fn test_mark_read_covers_every_shard() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file).await;
    let chat = store
        .conversations()
        .get_or_create_direct("alice", "bob")
        .await
        .unwrap();

    let mut from_alice = 0;
    for i in 0..37 {
        let sender = if i % 3 == 0 { "bob" } else { "alice" };
        if sender == "alice" {
            from_alice += 1;
        }
        store
            .messages()
            .append(&chat.id, sender, &format!("hole {}", i), None)
            .await
            .unwrap();
    }
    let before = store.conversations().summary(&chat.id).await.unwrap();
    assert_eq!(before.unread_for("bob"), from_alice);

    let report = store.receipts().mark_read(&chat.id, "bob").await.unwrap();
    assert_eq!(report.shards_scanned, 4);
    assert_eq!(report.messages_marked, from_alice as u64);
    assert!(report.failed_shards.is_empty());

    let mut cursor: Option<String> = None;
    loop {
        let page = store
            .pages()
            .page(&chat.id, 10, cursor.as_deref())
            .await
            .unwrap();
        for message in &page.messages {
            assert!(message.is_read_by("bob"), "{} unread", message.id);
        }
        if !page.has_more {
            break;
        }
        cursor = page.messages.first().map(|m| m.id.clone());
    }

    let after = store.conversations().summary(&chat.id).await.unwrap();
    assert_eq!(after.unread_for("bob"), 0);
    // Alice's counter is untouched by Bob reading
    assert_eq!(after.unread_for("alice"), before.unread_for("alice"));
}

#[tokio::test]
async fn test_mark_read_is_idempotent() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file).await;
    let chat = store
        .conversations()
        .get_or_create_direct("alice", "bob")
        .await
        .unwrap();
    for i in 0..5 {
        store
            .messages()
            .append(&chat.id, "alice", &format!("m{}", i), None)
            .await
            .unwrap();
    }

    let first = store.receipts().mark_read(&chat.id, "bob").await.unwrap();
    let second = store.receipts().mark_read(&chat.id, "bob").await.unwrap();
    assert_eq!(first.messages_marked, 5);
    assert_eq!(second.messages_marked, 0);

    let receipts = message_receipts::Entity::find()
        .filter(message_receipts::Column::ConversationId.eq(&chat.id))
        .filter(message_receipts::Column::UserId.eq("bob"))
        .count(store.db())
        .await
        .unwrap();
    assert_eq!(receipts, 5);
}

#[tokio::test]
async fn test_mark_read_on_empty_conversation() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file).await;
    let chat = store
        .conversations()
        .get_or_create_direct("alice", "bob")
        .await
        .unwrap();

    let report = store.receipts().mark_read(&chat.id, "alice").await.unwrap();
    assert_eq!(report.shards_scanned, 1);
    assert_eq!(report.messages_marked, 0);
}

#[tokio::test]
async fn test_mark_read_requires_participant() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = create_test_store(&temp_file).await;
    let chat = store
        .conversations()
        .get_or_create_direct("alice", "bob")
        .await
        .unwrap();

    let result = store.receipts().mark_read(&chat.id, "mallory").await;
    assert!(matches!(result, Err(StoreError::NotParticipant { .. })));
}

use std::time::Duration;
use tempfile::NamedTempFile;
use teebox_sync::{FailedMessage, FailedMessageQueue};

async fn open_queue() -> (FailedMessageQueue, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let queue = FailedMessageQueue::open(temp_file.path()).await.unwrap();
    (queue, temp_file)
}

#[tokio::test]
async fn test_enqueue_and_list_per_conversation() {
    let (queue, _temp) = open_queue().await;

    queue.enqueue("dm_a_b", "second", 2_000).await.unwrap();
    queue.enqueue("dm_a_b", "first", 1_000).await.unwrap();
    queue.enqueue("grp_x", "other", 1_500).await.unwrap();

    let pending = queue.pending_for("dm_a_b").await.unwrap();
    let contents: Vec<&str> = pending.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second"]);

    assert_eq!(queue.len().await.unwrap(), 3);
    assert_eq!(queue.all().await.unwrap()[1].conversation_id, "grp_x");
}

#[tokio::test]
async fn test_remove() {
    let (queue, _temp) = open_queue().await;
    let entry = queue.enqueue("dm_a_b", "hello", 1_000).await.unwrap();

    assert!(queue.remove(entry.id).await.unwrap());
    assert!(!queue.remove(entry.id).await.unwrap());
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_prune_uses_first_attempt_time() {
    let (queue, _temp) = open_queue().await;
    let retention = Duration::from_secs(24 * 3600);
    let now = 100 * 24 * 3600 * 1000;

    queue
        .enqueue("dm_a_b", "expired", now - 24 * 3600 * 1000 - 1)
        .await
        .unwrap();
    queue
        .enqueue("dm_a_b", "boundary", now - 24 * 3600 * 1000)
        .await
        .unwrap();
    queue.enqueue("dm_a_b", "recent", now - 1).await.unwrap();

    assert_eq!(queue.prune_expired(retention, now).await.unwrap(), 1);
    let left: Vec<String> = queue
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(left, vec!["boundary".to_string(), "recent".to_string()]);
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let temp_file = NamedTempFile::new().unwrap();
    {
        let queue = FailedMessageQueue::open(temp_file.path()).await.unwrap();
        queue.enqueue("dm_a_b", "persisted", 42).await.unwrap();
    }

    let queue = FailedMessageQueue::open(temp_file.path()).await.unwrap();
    let all = queue.all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].content, "persisted");
    assert_eq!(all[0].enqueued_at, 42);
}

#[test]
fn test_serialized_shape() {
    let entry = FailedMessage {
        id: 7,
        conversation_id: "dm_a_b".to_string(),
        content: "hi".to_string(),
        enqueued_at: 1_700_000_000_000,
    };
    let json = serde_json::to_value(&entry).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "conversationId": "dm_a_b",
            "content": "hi",
            "timestampEnqueued": 1_700_000_000_000i64,
        })
    );
}

use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use teebox_dm::{GetOrCreateChatRequest, RetryConfig, SendMessageRequest};
use teebox_node::LocalApi;
use teebox_store::{DmStore, StaticDirectory, StoreConfig};
use teebox_sync::{
    ConversationState, FailedMessageQueue, MessagingApi, SendOutcome, SyncConfig, SyncDriver,
    SyncEngine,
};
use tokio::time::timeout;

async fn open_store(temp_file: &NamedTempFile) -> DmStore {
    DmStore::open(StoreConfig {
        db_path: temp_file.path().to_path_buf(),
        shard_size: 3,
        ..Default::default()
    })
    .await
    .unwrap()
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        retry: RetryConfig::once(),
        receipt_delay: Duration::from_millis(20),
        receipt_cooldown: Duration::from_millis(20),
        tick_interval: Duration::from_millis(10),
        page_size: 4,
        ..Default::default()
    }
}

async fn engine_for(api: Arc<LocalApi>) -> (SyncEngine, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let queue = FailedMessageQueue::open(temp_file.path()).await.unwrap();
    let user = api.user_id().to_string();
    (SyncEngine::new(api, user, sync_config(), queue), temp_file)
}

#[tokio::test]
async fn test_history_spans_shards_through_the_engine() {
    let db = NamedTempFile::new().unwrap();
    let store = open_store(&db).await;
    let service = store.service(Arc::new(StaticDirectory::new(["alice", "bob"])));

    let bob = LocalApi::new(service.clone(), "bob");
    let chat = bob
        .get_or_create_chat(GetOrCreateChatRequest {
            peer_id: "alice".to_string(),
        })
        .await
        .unwrap();
    for i in 0..10 {
        bob.send_message(SendMessageRequest {
            conversation_id: chat.id.clone(),
            content: format!("hole {}", i + 1),
            idempotency_token: None,
        })
        .await
        .unwrap();
    }

    let alice = Arc::new(LocalApi::new(service.clone(), "alice"));
    let (mut engine, _queue) = engine_for(alice.clone()).await;
    engine.activate(&chat.id).await.unwrap();
    assert_eq!(engine.messages().len(), 4);

    while engine.load_older().await.unwrap() > 0 {}

    let messages = engine.messages();
    assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let mut contents: Vec<String> = messages.into_iter().map(|m| m.content).collect();
    contents.sort();
    let mut expected: Vec<String> = (1..=10).map(|i| format!("hole {}", i)).collect();
    expected.sort();
    assert_eq!(contents, expected);

    let totals = engine.total_unread().await.unwrap();
    assert_eq!(totals.total_unread, 10);

    // Everything loaded is unread and gets marked in one sweep
    let later = Instant::now() + Duration::from_secs(1);
    assert!(engine.flush_read_receipts(later).await.unwrap());
    assert_eq!(engine.total_unread().await.unwrap().total_unread, 0);
}

#[tokio::test]
async fn test_resent_token_is_stored_once() {
    let db = NamedTempFile::new().unwrap();
    let store = open_store(&db).await;
    let service = store.service(Arc::new(StaticDirectory::new(["alice", "bob"])));

    let alice = Arc::new(LocalApi::new(service.clone(), "alice"));
    let (mut engine, _queue) = engine_for(alice.clone()).await;
    engine.open_chat_with("bob").await.unwrap();

    let send = engine.begin_send("putt for par").unwrap();
    let first = alice.send_message(send.request.clone()).await.unwrap();
    let (send, second) = SyncEngine::deliver(alice.clone(), RetryConfig::once(), send).await;
    assert_eq!(second.as_ref().unwrap().message_id, first.message_id);

    let outcome = engine.complete_send(send, second).await.unwrap();
    assert_eq!(
        outcome,
        SendOutcome::Delivered {
            message_id: first.message_id.clone()
        }
    );
    assert_eq!(engine.messages().len(), 1);

    let chats = engine.refresh_chats(true).await.unwrap();
    assert_eq!(chats[0].message_count, 1);
}

#[tokio::test]
async fn test_two_drivers_see_each_other() {
    let db = NamedTempFile::new().unwrap();
    let store = open_store(&db).await;
    let service = store.service(Arc::new(StaticDirectory::new(["alice", "bob"])));

    let (alice_engine, _alice_queue) =
        engine_for(Arc::new(LocalApi::new(service.clone(), "alice"))).await;
    let (bob_engine, _bob_queue) =
        engine_for(Arc::new(LocalApi::new(service.clone(), "bob"))).await;
    let (alice_driver, alice) = SyncDriver::new(alice_engine);
    let (bob_driver, bob) = SyncDriver::new(bob_engine);
    let alice_task = alice_driver.spawn();
    let bob_task = bob_driver.spawn();

    let wait = Duration::from_secs(5);
    alice.open_chat("bob").await.unwrap();
    bob.open_chat("alice").await.unwrap();
    for handle in [&alice, &bob] {
        timeout(wait, handle.wait_for(|v| v.state == ConversationState::Ready))
            .await
            .unwrap()
            .unwrap();
    }

    alice.send_message("nice drive").await.unwrap();
    let view = timeout(wait, bob.wait_for(|v| v.messages.len() == 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.messages[0].sender_id, "alice");

    // Bob's engine marks it read after the debounce
    let view = timeout(
        wait,
        alice.wait_for(|v| v.messages.len() == 1 && v.messages[0].is_read_by("bob")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(view.messages[0].content, "nice drive");

    alice.shutdown();
    bob.shutdown();
    timeout(wait, alice_task).await.unwrap().unwrap();
    timeout(wait, bob_task).await.unwrap().unwrap();
}

mod common;

use common::{engine_with, test_config, MockApi, CONVERSATION, ME, PEER};
use std::time::Duration;
use teebox_sync::{Command, ConversationState, SyncDriver, SyncHandle};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start(api: std::sync::Arc<MockApi>) -> (SyncHandle, JoinHandle<()>, tempfile::NamedTempFile) {
    let (engine, temp) = engine_with(api, test_config()).await;
    let (driver, handle) = SyncDriver::new(engine);
    let task = driver.spawn();
    (handle, task, temp)
}

#[tokio::test]
async fn test_open_send_and_receive() {
    let api = MockApi::new();
    let (handle, task, _temp) = start(api.clone()).await;

    handle.open_chat(PEER).await.unwrap();
    let view = timeout(WAIT, handle.wait_for(|v| v.state == ConversationState::Ready))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.conversation_id.as_deref(), Some(CONVERSATION));

    handle.send_message("meet at the clubhouse").await.unwrap();
    let view = timeout(
        WAIT,
        handle.wait_for(|v| {
            !v.is_sending && v.messages.len() == 1 && !v.messages[0].id.starts_with("tmp_")
        }),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(view.messages[0].sender_id, ME);

    api.push_from(PEER, "see you there");
    let view = timeout(WAIT, handle.wait_for(|v| v.messages.len() == 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.messages[1].content, "see you there");

    // The incoming message gets marked read once the debounce passes
    timeout(WAIT, async {
        while api.mark_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    handle.shutdown();
    timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_offline_failure_is_replayed_on_reconnect() {
    let api = MockApi::new();
    let (handle, task, _temp) = start(api.clone()).await;

    handle
        .command(Command::Activate {
            conversation_id: CONVERSATION.to_string(),
        })
        .await
        .unwrap();
    timeout(WAIT, handle.wait_for(|v| v.state == ConversationState::Ready))
        .await
        .unwrap()
        .unwrap();

    api.fail_next_sends(1, false);
    handle.set_online(false);
    handle.send_message("lost in the rough").await.unwrap();
    let view = timeout(
        WAIT,
        handle.wait_for(|v| !v.online && !v.is_sending && v.last_error.is_some()),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(view.messages.is_empty());
    assert!(!view.online);

    handle.set_online(true);
    let view = timeout(
        WAIT,
        handle.wait_for(|v| v.online && v.messages.len() == 1 && !v.is_sending),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(view.messages[0].content, "lost in the rough");
    assert_eq!(api.stored().len(), 1);

    handle.command(Command::Shutdown).await.unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_errors_surface_in_view() {
    let api = MockApi::new();
    let (handle, task, _temp) = start(api.clone()).await;

    handle.open_chat("mallory").await.unwrap();
    let view = timeout(WAIT, handle.wait_for(|v| v.last_error.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert!(view.conversation_id.is_none());

    handle.shutdown();
    timeout(WAIT, task).await.unwrap().unwrap();
    assert!(handle.send_message("after shutdown").await.is_err());
}

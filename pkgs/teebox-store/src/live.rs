//! Live feed - pushes the authoritative recent messages of a conversation

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use teebox_dm::LiveUpdate;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One broadcast channel per watched conversation
#[derive(Clone)]
pub struct LiveFeed {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<LiveUpdate>>>>,
    capacity: usize,
}

impl Default for LiveFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<LiveUpdate> {
        let mut channels = self.channels.lock();
        channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns how many subscribers received the update
    pub fn publish(&self, update: LiveUpdate) -> usize {
        let mut channels = self.channels.lock();
        let Some(sender) = channels.get(&update.conversation_id) else {
            return 0;
        };

        let conversation_id = update.conversation_id.clone();
        match sender.send(update) {
            Ok(receivers) => {
                debug!("Pushed live update for {} to {}", conversation_id, receivers);
                receivers
            }
            Err(_) => {
                // Every subscriber is gone
                channels.remove(&conversation_id);
                0
            }
        }
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.channels
            .lock()
            .get(conversation_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

//! Teebox Sync - client-side synchronization for direct messages
//!
//! The [`SyncEngine`] owns what the user sees: the chat list, the open
//! conversation's message buffer and any messages still on their way to the
//! server. Sends are shown immediately as optimistic messages and reconciled
//! against the authoritative messages pushed by the live feed. Sends that
//! fail even after retries are rolled back and kept in a durable
//! [`FailedMessageQueue`] until the device reconnects.
//!
//! The [`SyncDriver`] runs an engine as a single task fed by UI commands,
//! live updates, network status changes and a receipt timer.

pub mod api;
pub mod cache;
pub mod driver;
pub mod engine;
pub mod entities;
pub mod error;
pub mod failed_queue;
pub mod migration;
pub mod read_receipts;
pub mod reconcile;

pub use api::MessagingApi;
pub use cache::TtlCache;
pub use driver::{Command, SyncDriver, SyncHandle};
pub use engine::{
    ConversationState, OutgoingSend, ReconnectReport, SendOutcome, SyncEngine, ViewSnapshot,
};
pub use error::{FailureKind, SyncError, SyncResult};
pub use failed_queue::{FailedMessage, FailedMessageQueue};
pub use read_receipts::ReadReceiptScheduler;

use std::time::Duration;
use teebox_dm::{RetryConfig, DEFAULT_PAGE_SIZE};

/// Configuration for the client sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Path to the SQLite file holding failed messages
    pub failed_queue_path: std::path::PathBuf,

    /// Backoff policy for sends
    pub retry: RetryConfig,

    /// Deadline for every other backend call (default: 10s)
    pub call_timeout: Duration,

    /// Largest clock difference at which an optimistic message still
    /// matches an authoritative one without a token (default: 10s)
    pub match_window: Duration,

    /// Wait before marking a burst of messages read (default: 500ms)
    pub receipt_delay: Duration,

    /// Minimum gap between two mark-read calls (default: 2s)
    pub receipt_cooldown: Duration,

    /// How long a marked message stays suppressed (default: 30s)
    pub recent_mark_ttl: Duration,

    /// How long the chat list is served from cache (default: 60s)
    pub chat_cache_ttl: Duration,

    /// Chats kept in the cache (default: 200)
    pub chat_cache_capacity: usize,

    /// Failed messages older than this are discarded (default: 24h)
    pub failed_retention: Duration,

    /// Messages per page (default: 30)
    pub page_size: u64,

    /// How often the driver checks for due read receipts (default: 250ms)
    pub tick_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            failed_queue_path: std::path::PathBuf::from("teebox-failed.db"),
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(10),
            match_window: Duration::from_secs(10),
            receipt_delay: Duration::from_millis(500),
            receipt_cooldown: Duration::from_secs(2),
            recent_mark_ttl: Duration::from_secs(30),
            chat_cache_ttl: Duration::from_secs(60),
            chat_cache_capacity: 200,
            failed_retention: Duration::from_secs(24 * 3600), // 24 hours
            page_size: DEFAULT_PAGE_SIZE,
            tick_interval: Duration::from_millis(250),
        }
    }
}

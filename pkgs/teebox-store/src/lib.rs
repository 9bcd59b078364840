//! Teebox Store - sharded direct-message storage
//!
//! This crate persists conversations and their messages in SQLite using
//! Sea-ORM and serves the direct-messaging request handlers.
//!
//! # Architecture
//!
//! - **ShardRouter**: maps a message position to one of a bounded number of shards
//! - **MessageLog**: append with idempotency guard, soft delete, existence lookup
//! - **Paginator**: cursor pages that walk shard boundaries newest to oldest
//! - **ReadReceiptUpdater**: concurrent per-shard read flips, then counter reset
//! - **ConversationStore**: participants, previews and unread counters
//! - **MetadataReconciler**: background replay of lagging metadata updates
//! - **LiveFeed**: per-conversation push of the authoritative recent messages
//! - **MessagingService**: authenticated request handlers over all of the above
//!
//! # Database Schema
//!
//! - `conversations`: message count, last message preview, timestamps
//! - `conversation_participants`: ordered membership with active/archived flags
//! - `unread_counters`: one counter per conversation and participant
//! - `messages`: message rows partitioned by `(conversation_id, shard)`
//! - `message_receipts`: one row per reader per message
//! - `pending_metadata`: appends whose metadata step has not been applied yet
//! - `store_settings`: the shard layout the database was created with
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use teebox_dm::SendMessageRequest;
//! use teebox_store::{DmStore, OpenDirectory, StoreConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = DmStore::open(StoreConfig {
//!     db_path: "teebox.db".into(),
//!     ..Default::default()
//! })
//! .await?;
//! let service = store.service(Arc::new(OpenDirectory));
//!
//! let chat = store.conversations().get_or_create_direct("alice", "bob").await?;
//! let sent = service
//!     .send_message(
//!         Some("alice"),
//!         SendMessageRequest {
//!             conversation_id: chat.id.clone(),
//!             content: "Tee time at 8?".to_string(),
//!             idempotency_token: None,
//!         },
//!     )
//!     .await?;
//! println!("sent {}", sent.message_id);
//! # Ok(())
//! # }
//! ```

pub mod conversation_store;
pub mod directory;
pub mod entities;
pub mod error;
pub mod live;
pub mod message_log;
pub mod migration;
pub mod pagination;
pub mod read_receipts;
pub mod reconciler;
pub mod service;
pub mod shard;

pub use conversation_store::ConversationStore;
pub use directory::{OpenDirectory, StaticDirectory, UserDirectory};
pub use error::{StoreError, StoreResult};
pub use live::LiveFeed;
pub use message_log::{AppendOutcome, MessageLog, MessageLookup};
pub use pagination::Paginator;
pub use read_receipts::{MarkReadReport, ReadReceiptUpdater};
pub use reconciler::{MetadataReconciler, ReconcileReport};
pub use service::MessagingService;
pub use shard::{ShardId, ShardRouter, DEFAULT_MAX_SHARDS, DEFAULT_SHARD_SIZE};

use anyhow::{bail, Context, Result};
use entities::store_settings;
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, EntityTrait, Set};
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use std::time::Duration;
use teebox_dm::MAX_CONTENT_LENGTH;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Configuration for the message store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub db_path: std::path::PathBuf,

    /// Messages per shard before the next one is used (default: 500)
    pub shard_size: u64,

    /// Upper bound on shards per conversation (default: 20)
    pub max_shards: u32,

    /// Content longer than this many characters is truncated (default: 2000)
    pub max_content_length: usize,

    /// Receipts written per query when marking a shard read (default: 500)
    pub read_batch_cap: u64,

    /// Shards swept concurrently by mark-read (default: 4)
    pub read_fanout: usize,

    /// Messages pushed with every live update (default: 50)
    pub live_page_size: u64,

    /// Deadline for one request handler in seconds (default: 10s)
    pub request_timeout_seconds: u64,

    /// Interval in seconds between reconciler passes (default: 30s)
    pub reconcile_interval_seconds: u64,

    /// Pending metadata rows handled per reconciler pass (default: 100)
    pub reconcile_batch_size: u64,

    /// Pending rows younger than this are left to the inline attempt (default: 5s)
    pub reconcile_min_age_seconds: u64,

    /// Take the shard layout recorded in an existing database instead of
    /// refusing to open when it differs from `shard_size`/`max_shards`
    /// (default: false)
    pub adopt_recorded_layout: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: std::path::PathBuf::from("teebox-store.db"),
            shard_size: DEFAULT_SHARD_SIZE,
            max_shards: DEFAULT_MAX_SHARDS,
            max_content_length: MAX_CONTENT_LENGTH,
            read_batch_cap: 500,
            read_fanout: 4,
            live_page_size: 50,
            request_timeout_seconds: 10,
            reconcile_interval_seconds: 30,
            reconcile_batch_size: 100,
            reconcile_min_age_seconds: 5,
            adopt_recorded_layout: false,
        }
    }
}

const SHARD_SIZE_KEY: &str = "shard_size";
const MAX_SHARDS_KEY: &str = "max_shards";

/// Record the shard layout on first open. Later opens must use the same
/// layout, since it decides which shard every stored message lives in.
async fn pin_shard_layout(db: &DatabaseConnection, config: &mut StoreConfig) -> Result<()> {
    let recorded_size = recorded_setting(db, SHARD_SIZE_KEY).await?;
    let recorded_max = recorded_setting(db, MAX_SHARDS_KEY).await?;

    if config.adopt_recorded_layout {
        if let Some(size) = &recorded_size {
            config.shard_size = size.parse().context("Corrupt recorded shard size")?;
        }
        if let Some(max) = &recorded_max {
            config.max_shards = max.parse().context("Corrupt recorded shard limit")?;
        }
    }

    for (key, recorded, wanted) in [
        (SHARD_SIZE_KEY, recorded_size, config.shard_size.to_string()),
        (MAX_SHARDS_KEY, recorded_max, config.max_shards.to_string()),
    ] {
        match recorded {
            Some(value) if value != wanted => bail!(
                "Database was created with {} = {}, cannot open it with {}",
                key,
                value,
                wanted
            ),
            Some(_) => {}
            None => {
                store_settings::ActiveModel {
                    key: Set(key.to_string()),
                    value: Set(wanted.clone()),
                }
                .insert(db)
                .await
                .with_context(|| format!("Failed to record {}", key))?;
                info!("Recorded {} = {}", key, wanted);
            }
        }
    }
    Ok(())
}

async fn recorded_setting(db: &DatabaseConnection, key: &str) -> Result<Option<String>> {
    let setting = store_settings::Entity::find_by_id(key.to_string())
        .one(db)
        .await
        .with_context(|| format!("Failed to read {}", key))?;
    Ok(setting.map(|s| s.value))
}

/// All store components over one database connection
#[derive(Clone)]
pub struct DmStore {
    db: DatabaseConnection,
    config: StoreConfig,
    router: ShardRouter,
    conversations: ConversationStore,
    messages: MessageLog,
    pages: Paginator,
    receipts: ReadReceiptUpdater,
    live: LiveFeed,
}

impl DmStore {
    /// Open (or create) the database at `config.db_path` and run migrations
    pub async fn open(mut config: StoreConfig) -> Result<Self> {
        let db_path_str = config
            .db_path
            .to_str()
            .context("Invalid database path")?
            .replace("\\", "/");
        let db_url = format!("sqlite:{}?mode=rwc", db_path_str);

        let db: DatabaseConnection = Database::connect(db_url.as_str())
            .await
            .context("Failed to connect to database")?;

        migration::Migrator::up(&db, None)
            .await
            .context("Failed to run migrations")?;
        pin_shard_layout(&db, &mut config).await?;

        info!("Message store initialized at {}", config.db_path.display());
        Ok(Self::with_connection(db, config))
    }

    /// Build the store over an existing, already migrated connection
    pub fn with_connection(db: DatabaseConnection, config: StoreConfig) -> Self {
        let router = ShardRouter::new(config.shard_size, config.max_shards);
        let conversations = ConversationStore::new(db.clone());
        let messages = MessageLog::new(
            db.clone(),
            router,
            conversations.clone(),
            config.max_content_length,
        );
        let pages = Paginator::new(db.clone(), router, conversations.clone(), messages.clone());
        let receipts = ReadReceiptUpdater::new(
            db.clone(),
            router,
            conversations.clone(),
            config.read_batch_cap,
            config.read_fanout,
        );

        Self {
            db,
            config,
            router,
            conversations,
            messages,
            pages,
            receipts,
            live: LiveFeed::default(),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn pages(&self) -> &Paginator {
        &self.pages
    }

    pub fn receipts(&self) -> &ReadReceiptUpdater {
        &self.receipts
    }

    pub fn live(&self) -> &LiveFeed {
        &self.live
    }

    pub fn reconciler(&self) -> MetadataReconciler {
        MetadataReconciler::new(
            self.db.clone(),
            self.conversations.clone(),
            self.config.reconcile_batch_size,
            Duration::from_secs(self.config.reconcile_interval_seconds),
            Duration::from_secs(self.config.reconcile_min_age_seconds),
        )
    }

    /// Start the metadata reconciler; it stops when `cancel` fires
    pub fn start_reconciler(&self, cancel: CancellationToken) -> JoinHandle<()> {
        info!(
            "Starting metadata reconciler (every {}s)",
            self.config.reconcile_interval_seconds
        );
        self.reconciler().spawn(cancel)
    }

    /// Request handlers sharing this store's live feed
    pub fn service(&self, directory: Arc<dyn UserDirectory>) -> MessagingService {
        MessagingService::new(
            self.conversations.clone(),
            self.messages.clone(),
            self.pages.clone(),
            self.receipts.clone(),
            self.live.clone(),
            directory,
            Duration::from_secs(self.config.request_timeout_seconds),
            self.config.live_page_size,
        )
    }
}

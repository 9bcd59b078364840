//! Durable queue of messages that could not be sent
//!
//! Entries survive restarts in a local SQLite file. They keep the time of
//! their first send attempt, so an entry that keeps failing still ages out
//! of the retention window.

use crate::entities::failed_messages;
use crate::error::SyncResult;
use crate::migration::Migrator;
use anyhow::{Context, Result};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use sea_orm_migration::MigratorTrait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMessage {
    #[serde(skip)]
    pub id: i32,
    pub conversation_id: String,
    pub content: String,
    #[serde(rename = "timestampEnqueued")]
    pub enqueued_at: i64,
}

impl From<failed_messages::Model> for FailedMessage {
    fn from(model: failed_messages::Model) -> Self {
        Self {
            id: model.id,
            conversation_id: model.conversation_id,
            content: model.content,
            enqueued_at: model.enqueued_at,
        }
    }
}

#[derive(Clone)]
pub struct FailedMessageQueue {
    db: DatabaseConnection,
}

impl FailedMessageQueue {
    /// Open (or create) the queue database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        let db_path_str = db_path
            .to_str()
            .context("Invalid database path")?
            .replace("\\", "/");
        let db_url = format!("sqlite:{}?mode=rwc", db_path_str);

        let db: DatabaseConnection = Database::connect(db_url.as_str())
            .await
            .context("Failed to connect to failed-message database")?;

        Migrator::up(&db, None)
            .await
            .context("Failed to run migrations")?;

        info!("Failed message queue initialized at {}", db_path.display());
        Ok(Self { db })
    }

    /// Use an existing, already migrated connection
    pub fn with_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        conversation_id: &str,
        content: &str,
        enqueued_at: i64,
    ) -> SyncResult<FailedMessage> {
        let model = failed_messages::ActiveModel {
            conversation_id: Set(conversation_id.to_string()),
            content: Set(content.to_string()),
            enqueued_at: Set(enqueued_at),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        info!(
            "Queued failed message {} for {}",
            model.id, conversation_id
        );
        Ok(model.into())
    }

    /// Entries for one conversation, oldest first
    pub async fn pending_for(&self, conversation_id: &str) -> SyncResult<Vec<FailedMessage>> {
        let models = failed_messages::Entity::find()
            .filter(failed_messages::Column::ConversationId.eq(conversation_id))
            .order_by_asc(failed_messages::Column::EnqueuedAt)
            .order_by_asc(failed_messages::Column::Id)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(Into::into).collect())
    }

    /// Every entry, oldest first
    pub async fn all(&self) -> SyncResult<Vec<FailedMessage>> {
        let models = failed_messages::Entity::find()
            .order_by_asc(failed_messages::Column::EnqueuedAt)
            .order_by_asc(failed_messages::Column::Id)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(Into::into).collect())
    }

    pub async fn remove(&self, id: i32) -> SyncResult<bool> {
        let result = failed_messages::Entity::delete_by_id(id)
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Drop entries first attempted more than `retention` before `now_millis`
    pub async fn prune_expired(&self, retention: Duration, now_millis: i64) -> SyncResult<u64> {
        let cutoff = now_millis - retention.as_millis() as i64;
        let result = failed_messages::Entity::delete_many()
            .filter(failed_messages::Column::EnqueuedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        if result.rows_affected > 0 {
            info!(
                "Discarded {} failed messages older than {:?}",
                result.rows_affected, retention
            );
        }
        Ok(result.rows_affected)
    }

    pub async fn len(&self) -> SyncResult<u64> {
        let count = failed_messages::Entity::find().count(&self.db).await?;
        debug!("Failed message queue holds {} entries", count);
        Ok(count)
    }

    pub async fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len().await? == 0)
    }
}

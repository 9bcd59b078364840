//! Metadata reconciler - finishes appends whose metadata step did not land

use crate::conversation_store::ConversationStore;
use crate::entities::pending_metadata;
use crate::error::StoreResult;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use std::time::Duration;
use teebox_dm::now_millis;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub applied: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct MetadataReconciler {
    db: DatabaseConnection,
    conversations: ConversationStore,
    batch_size: u64,
    interval: Duration,
    /// Rows younger than this are left to the inline attempt
    min_age: Duration,
}

impl MetadataReconciler {
    pub fn new(
        db: DatabaseConnection,
        conversations: ConversationStore,
        batch_size: u64,
        interval: Duration,
        min_age: Duration,
    ) -> Self {
        Self {
            db,
            conversations,
            batch_size: batch_size.max(1),
            interval,
            min_age,
        }
    }

    /// Apply one batch of pending metadata, oldest first
    pub async fn run_once(&self) -> StoreResult<ReconcileReport> {
        let cutoff = now_millis() - self.min_age.as_millis() as i64;
        let pending: Vec<String> = pending_metadata::Entity::find()
            .select_only()
            .column(pending_metadata::Column::MessageId)
            .filter(pending_metadata::Column::CreatedAt.lte(cutoff))
            .order_by_asc(pending_metadata::Column::CreatedAt)
            .limit(self.batch_size)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut report = ReconcileReport::default();
        for message_id in pending {
            match self.conversations.apply_pending(&message_id).await {
                Ok(true) => report.applied += 1,
                Ok(false) => debug!("Metadata for {} already applied", message_id),
                Err(e) => {
                    warn!("Reconciling metadata for {} failed: {}", message_id, e);
                    self.conversations.note_pending_failure(&message_id).await;
                    report.failed += 1;
                }
            }
        }

        if report.applied > 0 || report.failed > 0 {
            info!(
                "Metadata reconciler applied {} and failed {}",
                report.applied, report.failed
            );
        }
        Ok(report)
    }

    /// Run until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Metadata reconciler stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!("Metadata reconciler pass failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

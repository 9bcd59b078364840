use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum PendingMetadata {
    Table,
    MessageId,
    ConversationId,
    SenderId,
    Content,
    Timestamp,
    Attempts,
    CreatedAt,
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260301_000006_create_pending_metadata_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PendingMetadata::Table)
                    .col(
                        ColumnDef::new(PendingMetadata::MessageId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PendingMetadata::ConversationId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PendingMetadata::SenderId).string().not_null())
                    .col(ColumnDef::new(PendingMetadata::Content).string().not_null())
                    .col(
                        ColumnDef::new(PendingMetadata::Timestamp)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PendingMetadata::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PendingMetadata::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_pending_metadata_created")
                    .table(PendingMetadata::Table)
                    .col(PendingMetadata::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PendingMetadata::Table).to_owned())
            .await
    }
}

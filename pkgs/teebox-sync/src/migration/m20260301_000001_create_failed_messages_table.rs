use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum FailedMessages {
    Table,
    Id,
    ConversationId,
    Content,
    EnqueuedAt,
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260301_000001_create_failed_messages_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FailedMessages::Table)
                    .col(
                        ColumnDef::new(FailedMessages::Id)
                            .integer()
                            .not_null()
                            .primary_key()
                            .auto_increment(),
                    )
                    .col(
                        ColumnDef::new(FailedMessages::ConversationId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(FailedMessages::Content).string().not_null())
                    .col(
                        ColumnDef::new(FailedMessages::EnqueuedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_failed_messages_conversation")
                    .table(FailedMessages::Table)
                    .col(FailedMessages::ConversationId)
                    .col(FailedMessages::EnqueuedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FailedMessages::Table).to_owned())
            .await
    }
}

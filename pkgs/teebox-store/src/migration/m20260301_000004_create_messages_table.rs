use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum Messages {
    Table,
    Id,
    ConversationId,
    Shard,
    SenderId,
    Content,
    Timestamp,
    Deleted,
    IdempotencyToken,
}

#[derive(DeriveIden)]
enum Conversations {
    Table,
    Id,
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260301_000004_create_messages_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Messages::Table)
                    .col(
                        ColumnDef::new(Messages::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Messages::ConversationId).string().not_null())
                    .col(ColumnDef::new(Messages::Shard).integer().not_null())
                    .col(ColumnDef::new(Messages::SenderId).string().not_null())
                    .col(ColumnDef::new(Messages::Content).string().not_null())
                    .col(ColumnDef::new(Messages::Timestamp).big_integer().not_null())
                    .col(
                        ColumnDef::new(Messages::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Messages::IdempotencyToken).string())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_messages_conversation")
                            .from(Messages::Table, Messages::ConversationId)
                            .to(Conversations::Table, Conversations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Every read walks one (conversation, shard) partition in time order
        manager
            .create_index(
                Index::create()
                    .name("idx_messages_conversation_shard_timestamp")
                    .table(Messages::Table)
                    .col(Messages::ConversationId)
                    .col(Messages::Shard)
                    .col(Messages::Timestamp)
                    .to_owned(),
            )
            .await?;

        // NULL tokens never collide in SQLite unique indexes
        manager
            .create_index(
                Index::create()
                    .name("idx_messages_idempotency_token")
                    .table(Messages::Table)
                    .col(Messages::ConversationId)
                    .col(Messages::Shard)
                    .col(Messages::IdempotencyToken)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Messages::Table).to_owned())
            .await
    }
}

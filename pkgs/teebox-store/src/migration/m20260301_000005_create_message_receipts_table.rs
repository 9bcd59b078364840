use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum MessageReceipts {
    Table,
    MessageId,
    UserId,
    ConversationId,
    Shard,
    ReadAt,
}

#[derive(DeriveIden)]
enum Messages {
    Table,
    Id,
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260301_000005_create_message_receipts_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MessageReceipts::Table)
                    .col(
                        ColumnDef::new(MessageReceipts::MessageId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(MessageReceipts::UserId).string().not_null())
                    .col(
                        ColumnDef::new(MessageReceipts::ConversationId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(MessageReceipts::Shard).integer().not_null())
                    .col(
                        ColumnDef::new(MessageReceipts::ReadAt)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(MessageReceipts::MessageId)
                            .col(MessageReceipts::UserId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_message_receipts_message")
                            .from(MessageReceipts::Table, MessageReceipts::MessageId)
                            .to(Messages::Table, Messages::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_message_receipts_user_shard")
                    .table(MessageReceipts::Table)
                    .col(MessageReceipts::ConversationId)
                    .col(MessageReceipts::Shard)
                    .col(MessageReceipts::UserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MessageReceipts::Table).to_owned())
            .await
    }
}

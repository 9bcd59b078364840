use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum UnreadCounters {
    Table,
    ConversationId,
    UserId,
    Count,
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260301_000003_create_unread_counters_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UnreadCounters::Table)
                    .col(
                        ColumnDef::new(UnreadCounters::ConversationId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(UnreadCounters::UserId).string().not_null())
                    .col(
                        ColumnDef::new(UnreadCounters::Count)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .primary_key(
                        Index::create()
                            .col(UnreadCounters::ConversationId)
                            .col(UnreadCounters::UserId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_unread_counters_user")
                    .table(UnreadCounters::Table)
                    .col(UnreadCounters::UserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UnreadCounters::Table).to_owned())
            .await
    }
}

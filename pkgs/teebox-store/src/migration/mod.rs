//! Sea-ORM migrations for the teebox-store schema

pub use sea_orm_migration::prelude::*;

mod m20260301_000001_create_conversations_table;
mod m20260301_000002_create_conversation_participants_table;
mod m20260301_000003_create_unread_counters_table;
mod m20260301_000004_create_messages_table;
mod m20260301_000005_create_message_receipts_table;
mod m20260301_000006_create_pending_metadata_table;
mod m20260301_000007_create_store_settings_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_create_conversations_table::Migration),
            Box::new(m20260301_000002_create_conversation_participants_table::Migration),
            Box::new(m20260301_000003_create_unread_counters_table::Migration),
            Box::new(m20260301_000004_create_messages_table::Migration),
            Box::new(m20260301_000005_create_message_receipts_table::Migration),
            Box::new(m20260301_000006_create_pending_metadata_table::Migration),
            Box::new(m20260301_000007_create_store_settings_table::Migration),
        ]
    }
}

//! Sea-ORM entities for teebox-store

pub mod conversation_participants;
pub mod conversations;
pub mod message_receipts;
pub mod messages;
pub mod pending_metadata;
pub mod store_settings;
pub mod unread_counters;

pub use conversation_participants::Entity as ConversationParticipants;
pub use conversations::Entity as Conversations;
pub use message_receipts::Entity as MessageReceipts;
pub use messages::Entity as Messages;
pub use pending_metadata::Entity as PendingMetadata;
pub use store_settings::Entity as StoreSettings;
pub use unread_counters::Entity as UnreadCounters;

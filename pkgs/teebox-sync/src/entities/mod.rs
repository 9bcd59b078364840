//! Sea-ORM entities for the client-local database

pub mod failed_messages;

pub use failed_messages::Entity as FailedMessages;

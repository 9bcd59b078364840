//! Store errors and their wire codes

use sea_orm::DbErr;
use teebox_dm::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("User {user_id} is not a participant of {conversation_id}")]
    NotParticipant {
        conversation_id: String,
        user_id: String,
    },
    #[error("Only the sender may delete message {0}")]
    NotSender(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::ConversationNotFound(_)
            | StoreError::MessageNotFound(_)
            | StoreError::UserNotFound(_) => ErrorCode::NotFound,
            StoreError::NotParticipant { .. } | StoreError::NotSender(_) => {
                ErrorCode::PermissionDenied
            }
            StoreError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            StoreError::Database(DbErr::ConnectionAcquire(_)) => ErrorCode::ResourceExhausted,
            StoreError::Database(_) => ErrorCode::Internal,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let code = err.code();
        // Database details stay in the server log
        let message = match &err {
            StoreError::Database(_) => "Storage failure".to_string(),
            other => other.to_string(),
        };
        ApiError::new(code, message)
    }
}

/// SQLite reports unique index violations only through the error text
pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    err.to_string().contains("UNIQUE constraint failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            StoreError::MessageNotFound("m".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            StoreError::NotSender("m".into()).code(),
            ErrorCode::PermissionDenied
        );
        assert_eq!(
            StoreError::Database(DbErr::Custom("boom".into())).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_database_details_are_not_leaked() {
        let api: ApiError = StoreError::Database(DbErr::Custom("secret path".into())).into();
        assert_eq!(api.code, ErrorCode::Internal);
        assert!(!api.message.contains("secret"));
    }
}

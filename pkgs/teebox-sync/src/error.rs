//! Sync errors and user-facing failure classification

use sea_orm::DbErr;
use teebox_dm::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("Failed message queue error: {0}")]
    Queue(#[from] DbErr),
    #[error("No conversation is open")]
    NoActiveConversation,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Sync driver has stopped")]
    Stopped,
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Why a send ultimately failed, as far as the user is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    PermissionDenied,
    Unavailable,
    Timeout,
    Network,
    Unknown,
}

impl FailureKind {
    pub fn classify(error: &ApiError) -> Self {
        match error.code {
            ErrorCode::NotFound => FailureKind::NotFound,
            ErrorCode::PermissionDenied | ErrorCode::Unauthenticated => {
                FailureKind::PermissionDenied
            }
            ErrorCode::Unavailable | ErrorCode::ResourceExhausted => FailureKind::Unavailable,
            ErrorCode::DeadlineExceeded => FailureKind::Timeout,
            ErrorCode::Network => FailureKind::Network,
            ErrorCode::InvalidArgument | ErrorCode::Internal => FailureKind::Unknown,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "This conversation no longer exists.",
            FailureKind::PermissionDenied => "You can't send messages in this conversation.",
            FailureKind::Unavailable => "Messaging is temporarily unavailable. We'll retry later.",
            FailureKind::Timeout => "Sending took too long. We'll retry when you're back online.",
            FailureKind::Network => "You appear to be offline. We'll retry when you reconnect.",
            FailureKind::Unknown => "Message failed to send. Please try again.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let cases = [
            (ErrorCode::NotFound, FailureKind::NotFound),
            (ErrorCode::PermissionDenied, FailureKind::PermissionDenied),
            (ErrorCode::Unavailable, FailureKind::Unavailable),
            (ErrorCode::DeadlineExceeded, FailureKind::Timeout),
            (ErrorCode::Network, FailureKind::Network),
            (ErrorCode::Internal, FailureKind::Unknown),
        ];
        for (code, kind) in cases {
            assert_eq!(FailureKind::classify(&ApiError::new(code, "x")), kind);
        }
    }

    #[test]
    fn test_user_messages_are_distinct() {
        let kinds = [
            FailureKind::NotFound,
            FailureKind::PermissionDenied,
            FailureKind::Unavailable,
            FailureKind::Timeout,
            FailureKind::Network,
            FailureKind::Unknown,
        ];
        let mut messages: Vec<&str> = kinds.iter().map(|k| k.user_message()).collect();
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), kinds.len());
    }
}

//! User directory - profile lookups owned by the profile service

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use teebox_dm::ApiError;

/// Looks up users by id
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, user_id: &str) -> Result<bool, ApiError>;
}

/// Treats every id as an existing user
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl UserDirectory for OpenDirectory {
    async fn user_exists(&self, _user_id: &str) -> Result<bool, ApiError> {
        Ok(true)
    }
}

/// Fixed in-memory set of users
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: RwLock<HashSet<String>>,
}

impl StaticDirectory {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: RwLock::new(users.into_iter().map(Into::into).collect()),
        }
    }

    pub fn add(&self, user_id: &str) {
        self.users.write().insert(user_id.to_string());
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn user_exists(&self, user_id: &str) -> Result<bool, ApiError> {
        Ok(self.users.read().contains(user_id))
    }
}

//! Contract for the document store holding users, chats, their hooks and the
//! OAuth correlation cache.
//!
//! Implementations must keep hook tokens globally unique: any write that would
//! introduce a token already owned by another user or chat (or twice in the same
//! document) fails with [`StoreError::DuplicateToken`] and leaves the store
//! unchanged.

use std::collections::HashSet;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::model::{
    ChatData, ChatId, Hook, OAuthCorrelation, OAuthProviderRecord, RequestToken, UserData, UserId,
};
use crate::query::Query;

mod memory;
mod pool;
#[cfg(feature = "store_sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
pub use pool::{StoreHandle, StorePool};
#[cfg(feature = "store_sqlite")]
pub use sqlite::SqliteStore;

pub type UserUpdate = Box<dyn FnOnce(&mut UserData) + Send>;
pub type ChatUpdate = Box<dyn FnOnce(&mut ChatData) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("hook token {0} is already registered")]
    DuplicateToken(String),
    #[error("store handle pool is closed")]
    PoolClosed,
    #[error("document encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_user(&self, query: &Query) -> Result<Option<UserData>, StoreError>;
    async fn find_users(&self, query: &Query) -> Result<Vec<UserData>, StoreError>;
    async fn find_chat(&self, query: &Query) -> Result<Option<ChatData>, StoreError>;
    async fn find_chats(&self, query: &Query) -> Result<Vec<ChatData>, StoreError>;

    /// Atomically applies `update` to the user document, creating it when
    /// missing, and returns the stored result.
    async fn update_user(&self, id: UserId, update: UserUpdate) -> Result<UserData, StoreError>;
    async fn update_chat(&self, id: ChatId, update: ChatUpdate) -> Result<ChatData, StoreError>;

    /// Removes the hook with `token` from whichever document owns it.
    async fn remove_hook(&self, token: &str) -> Result<bool, StoreError>;

    async fn put_correlation(&self, record: &OAuthCorrelation) -> Result<(), StoreError>;
    async fn get_correlation(
        &self,
        ephemeral_id: &str,
    ) -> Result<Option<OAuthCorrelation>, StoreError>;
    /// Returns `false` when no record exists for `ephemeral_id`.
    async fn set_request_token(
        &self,
        ephemeral_id: &str,
        token: &RequestToken,
    ) -> Result<bool, StoreError>;
    /// Drops correlation records created before `cutoff`.
    async fn purge_correlations(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError>;

    async fn put_oauth_provider(&self, provider: &OAuthProviderRecord) -> Result<(), StoreError>;
    async fn get_oauth_provider(
        &self,
        internal_id: &str,
    ) -> Result<Option<OAuthProviderRecord>, StoreError>;

    async fn get_user(&self, id: UserId) -> Result<Option<UserData>, StoreError> {
        self.find_user(&Query::id(id)).await
    }

    async fn get_chat(&self, id: ChatId) -> Result<Option<ChatData>, StoreError> {
        self.find_chat(&Query::id(id)).await
    }

    async fn save_user(&self, user: UserData) -> Result<UserData, StoreError> {
        let id = user.id;
        self.update_user(id, Box::new(move |doc| *doc = user)).await
    }

    async fn save_chat(&self, chat: ChatData) -> Result<ChatData, StoreError> {
        let id = chat.id;
        self.update_chat(id, Box::new(move |doc| *doc = chat)).await
    }

    async fn add_user_hook(&self, user_id: UserId, hook: Hook) -> Result<UserData, StoreError> {
        self.update_user(user_id, Box::new(move |doc| doc.hooks.push(hook)))
            .await
    }

    async fn add_chat_hook(&self, chat_id: ChatId, hook: Hook) -> Result<ChatData, StoreError> {
        self.update_chat(chat_id, Box::new(move |doc| doc.hooks.push(hook)))
            .await
    }

    async fn set_user_tz(&self, user_id: UserId, tz: &str) -> Result<(), StoreError> {
        let tz = tz.to_string();
        self.update_user(user_id, Box::new(move |doc| doc.tz = Some(tz)))
            .await
            .map(|_| ())
    }
}

/// Tokens present in `after` but not in `before`; fails on a token repeated
/// within `after` itself.
pub(crate) fn introduced_tokens(before: &[Hook], after: &[Hook]) -> Result<Vec<String>, StoreError> {
    let mut seen = HashSet::new();
    for hook in after {
        if !seen.insert(hook.token.as_str()) {
            return Err(StoreError::DuplicateToken(hook.token.clone()));
        }
    }
    let existing: HashSet<&str> = before.iter().map(|h| h.token.as_str()).collect();
    Ok(after
        .iter()
        .filter(|h| !existing.contains(h.token.as_str()))
        .map(|h| h.token.clone())
        .collect())
}

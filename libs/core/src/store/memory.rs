use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{ChatUpdate, StoreError, SubscriptionStore, UserUpdate, introduced_tokens};
use crate::model::{
    ChatData, ChatId, OAuthCorrelation, OAuthProviderRecord, RequestToken, UserData, UserId,
};
use crate::query::Query;

#[derive(Default)]
struct Collections {
    users: BTreeMap<UserId, UserData>,
    chats: BTreeMap<ChatId, ChatData>,
    users_cache: HashMap<String, OAuthCorrelation>,
    oauth_providers: HashMap<String, OAuthProviderRecord>,
}

impl Collections {
    fn token_taken(&self, token: &str, skip_user: Option<UserId>, skip_chat: Option<ChatId>) -> bool {
        let in_users = self
            .users
            .values()
            .filter(|u| Some(u.id) != skip_user)
            .any(|u| u.hook(token).is_some());
        let in_chats = self
            .chats
            .values()
            .filter(|c| Some(c.id) != skip_chat)
            .any(|c| c.hook(token).is_some());
        in_users || in_chats
    }
}

/// Process-local store, used by tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Collections>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn filter_docs<T: Serialize + Clone>(
    docs: impl Iterator<Item = T>,
    query: &Query,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for doc in docs {
        if query.matches(&serde_json::to_value(&doc)?) {
            out.push(doc);
        }
    }
    Ok(out)
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn find_user(&self, query: &Query) -> Result<Option<UserData>, StoreError> {
        Ok(self.find_users(query).await?.into_iter().next())
    }

    async fn find_users(&self, query: &Query) -> Result<Vec<UserData>, StoreError> {
        let guard = self.inner.read().await;
        filter_docs(guard.users.values().cloned(), query)
    }

    async fn find_chat(&self, query: &Query) -> Result<Option<ChatData>, StoreError> {
        Ok(self.find_chats(query).await?.into_iter().next())
    }

    async fn find_chats(&self, query: &Query) -> Result<Vec<ChatData>, StoreError> {
        let guard = self.inner.read().await;
        filter_docs(guard.chats.values().cloned(), query)
    }

    async fn update_user(&self, id: UserId, update: UserUpdate) -> Result<UserData, StoreError> {
        let mut guard = self.inner.write().await;
        let before = guard
            .users
            .get(&id)
            .cloned()
            .unwrap_or_else(|| UserData::new(id));
        let mut after = before.clone();
        update(&mut after);
        after.id = id;
        for token in introduced_tokens(&before.hooks, &after.hooks)? {
            if guard.token_taken(&token, Some(id), None) {
                return Err(StoreError::DuplicateToken(token));
            }
        }
        guard.users.insert(id, after.clone());
        Ok(after)
    }

    async fn update_chat(&self, id: ChatId, update: ChatUpdate) -> Result<ChatData, StoreError> {
        let mut guard = self.inner.write().await;
        let before = guard
            .chats
            .get(&id)
            .cloned()
            .unwrap_or_else(|| ChatData::new(id));
        let mut after = before.clone();
        update(&mut after);
        after.id = id;
        for token in introduced_tokens(&before.hooks, &after.hooks)? {
            if guard.token_taken(&token, None, Some(id)) {
                return Err(StoreError::DuplicateToken(token));
            }
        }
        guard.chats.insert(id, after.clone());
        Ok(after)
    }

    async fn remove_hook(&self, token: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        for user in guard.users.values_mut() {
            let len = user.hooks.len();
            user.hooks.retain(|h| h.token != token);
            if user.hooks.len() != len {
                return Ok(true);
            }
        }
        for chat in guard.chats.values_mut() {
            let len = chat.hooks.len();
            chat.hooks.retain(|h| h.token != token);
            if chat.hooks.len() != len {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn put_correlation(&self, record: &OAuthCorrelation) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.users_cache.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn get_correlation(
        &self,
        ephemeral_id: &str,
    ) -> Result<Option<OAuthCorrelation>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .users_cache
            .get(&OAuthCorrelation::key_for(ephemeral_id))
            .cloned())
    }

    async fn set_request_token(
        &self,
        ephemeral_id: &str,
        token: &RequestToken,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        match guard
            .users_cache
            .get_mut(&OAuthCorrelation::key_for(ephemeral_id))
        {
            Some(record) => {
                record.val.request_token = Some(token.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_correlations(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError> {
        let mut guard = self.inner.write().await;
        let before = guard.users_cache.len();
        guard.users_cache.retain(|_, record| record.created_at >= cutoff);
        Ok(before - guard.users_cache.len())
    }

    async fn put_oauth_provider(&self, provider: &OAuthProviderRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .oauth_providers
            .insert(provider.internal_id(), provider.clone());
        Ok(())
    }

    async fn get_oauth_provider(
        &self,
        internal_id: &str,
    ) -> Result<Option<OAuthProviderRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.oauth_providers.get(internal_id).cloned())
    }
}

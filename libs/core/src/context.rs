use std::sync::Arc;

use crate::model::{ChatId, UserData};
use crate::store::StoreHandle;

/// Per-target execution context handed to service handlers.
///
/// Shared parts (store handle, request id, public URL) are reference counted;
/// the current user and chat are owned so every derived child starts from its
/// own copy.
#[derive(Clone)]
pub struct DispatchContext {
    store: Arc<StoreHandle>,
    request_id: Arc<str>,
    public_base_url: Arc<str>,
    pub service_name: Option<String>,
    pub user: Option<UserData>,
    pub chat_id: Option<ChatId>,
}

impl DispatchContext {
    pub fn new(
        store: StoreHandle,
        request_id: impl Into<Arc<str>>,
        public_base_url: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            store: Arc::new(store),
            request_id: request_id.into(),
            public_base_url: public_base_url.into(),
            service_name: None,
            user: None,
            chat_id: None,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn public_base_url(&self) -> &str {
        &self.public_base_url
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service_name = Some(service.into());
        self
    }

    pub fn with_user(mut self, user: UserData) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_chat(mut self, chat_id: ChatId) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    /// Child context addressing `chat_id`, keeping the current user.
    pub fn for_chat(&self, chat_id: ChatId) -> Self {
        self.clone().with_chat(chat_id)
    }

    /// Child context for a matched user; the user's private chat becomes the
    /// target.
    pub fn for_user(&self, user: UserData) -> Self {
        let chat_id = user.private_chat_id();
        self.clone().with_user(user).with_chat(chat_id)
    }

    /// Non-zero chat id of this context, if any.
    pub fn target_chat(&self) -> Option<ChatId> {
        self.chat_id.filter(|id| *id != 0)
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("request_id", &self.request_id)
            .field("service_name", &self.service_name)
            .field("user_id", &self.user.as_ref().map(|u| u.id))
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

//! Capability descriptors for service plugins.
//!
//! A service exposes a required [`WebhookHandler`] plus optional token, event,
//! OAuth and post-authorization hooks. Descriptors are built once at startup and
//! shared read-only through the [`ServiceRegistry`](crate::registry::ServiceRegistry).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;

use crate::context::DispatchContext;
use crate::model::RequestToken;
use crate::query::Query;

/// Raw inbound delivery as seen by handlers.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub request_id: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub query: BTreeMap<String, String>,
    pub body: Bytes,
}

impl WebhookRequest {
    pub fn new(request_id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            request_id: request_id.into(),
            method: Method::POST,
            headers: HeaderMap::new(),
            query: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Which collection an auto-detect or event query runs against.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetQuery {
    Chats(Query),
    Users(Query),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// The receiving side is rate limiting; remaining fan-out must stop.
    Flood,
    Failed,
}

#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct HandlerError {
    kind: HandlerErrorKind,
    #[source]
    source: anyhow::Error,
}

impl HandlerError {
    pub fn flood(message: impl fmt::Display) -> Self {
        Self {
            kind: HandlerErrorKind::Flood,
            source: anyhow::anyhow!("{message}"),
        }
    }

    pub fn failed(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: HandlerErrorKind::Failed,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> HandlerErrorKind {
        self.kind
    }

    pub fn is_flood(&self) -> bool {
        self.kind == HandlerErrorKind::Flood
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(source: anyhow::Error) -> Self {
        Self::failed(source)
    }
}

/// Per-target outcome inspected by dispatch loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Handled,
    Failed,
    Flood,
}

impl DispatchKind {
    pub fn of(result: &Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => DispatchKind::Handled,
            Err(err) if err.is_flood() => DispatchKind::Flood,
            Err(_) => DispatchKind::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DispatchKind::Handled => "handled",
            DispatchKind::Failed => "failed",
            DispatchKind::Flood => "flood",
        }
    }
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &DispatchContext,
        request: &WebhookRequest,
    ) -> Result<(), HandlerError>;
}

/// Turns a tokenless delivery into a store query. `Ok(None)` means no action.
#[async_trait]
pub trait TokenHandler: Send + Sync {
    async fn resolve(
        &self,
        ctx: &DispatchContext,
        request: &WebhookRequest,
    ) -> anyhow::Result<Option<TargetQuery>>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &DispatchContext, payload: &Value) -> Result<(), HandlerError>;
}

/// Credentials produced by a completed authorization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessGrant {
    pub access_token: String,
    pub token_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

/// Replaces the default `code` exchange for OAuth2 services with their own
/// callback handling.
#[async_trait]
pub trait AccessTokenReceiver: Send + Sync {
    async fn receive(
        &self,
        ctx: &DispatchContext,
        query: &BTreeMap<String, String>,
    ) -> anyhow::Result<AccessGrant>;
}

/// Replaces the default `oauth_verifier` exchange for OAuth1 services.
#[async_trait]
pub trait OAuth1Receiver: Send + Sync {
    async fn receive(
        &self,
        ctx: &DispatchContext,
        query: &BTreeMap<String, String>,
        request_token: &RequestToken,
    ) -> anyhow::Result<AccessGrant>;
}

/// Background job run after credentials were stored. Failures are only logged.
#[async_trait]
pub trait OAuthSuccessHandler: Send + Sync {
    async fn on_success(&self, ctx: DispatchContext) -> anyhow::Result<()>;
}

/// Endpoint paths may be absolute or relative to the provider base URL.
#[derive(Clone)]
pub struct OAuth1Config {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub request_token_url: String,
    pub authorize_url: String,
    pub access_token_url: String,
    pub receiver: Option<Arc<dyn OAuth1Receiver>>,
}

#[derive(Clone)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub receiver: Option<Arc<dyn AccessTokenReceiver>>,
}

#[derive(Clone)]
pub enum OAuthConfig {
    OAuth1(OAuth1Config),
    OAuth2(OAuth2Config),
}

impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OAuthConfig::OAuth1(cfg) => f
                .debug_struct("OAuth1")
                .field("consumer_key", &cfg.consumer_key)
                .field("request_token_url", &cfg.request_token_url)
                .finish_non_exhaustive(),
            OAuthConfig::OAuth2(cfg) => f
                .debug_struct("OAuth2")
                .field("client_id", &cfg.client_id)
                .field("token_url", &cfg.token_url)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub base_url: String,
    pub bot_username: String,
    pub webhook: Arc<dyn WebhookHandler>,
    pub token_handler: Option<Arc<dyn TokenHandler>>,
    pub event_handler: Option<Arc<dyn EventHandler>>,
    pub oauth: Option<OAuthConfig>,
    pub on_oauth_success: Option<Arc<dyn OAuthSuccessHandler>>,
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("bot_username", &self.bot_username)
            .field("token_handler", &self.token_handler.is_some())
            .field("event_handler", &self.event_handler.is_some())
            .field("oauth", &self.oauth)
            .finish()
    }
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, webhook: Arc<dyn WebhookHandler>) -> Self {
        Self {
            name: name.into(),
            base_url: String::new(),
            bot_username: String::new(),
            webhook,
            token_handler: None,
            event_handler: None,
            oauth: None,
            on_oauth_success: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_bot(mut self, username: impl Into<String>) -> Self {
        self.bot_username = username.into();
        self
    }

    pub fn with_token_handler(mut self, handler: Arc<dyn TokenHandler>) -> Self {
        self.token_handler = Some(handler);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn with_oauth1(mut self, config: OAuth1Config) -> Self {
        self.oauth = Some(OAuthConfig::OAuth1(config));
        self
    }

    pub fn with_oauth2(mut self, config: OAuth2Config) -> Self {
        self.oauth = Some(OAuthConfig::OAuth2(config));
        self
    }

    pub fn with_oauth_success(mut self, handler: Arc<dyn OAuthSuccessHandler>) -> Self {
        self.on_oauth_success = Some(handler);
        self
    }

    pub fn oauth1(&self) -> Option<&OAuth1Config> {
        match &self.oauth {
            Some(OAuthConfig::OAuth1(cfg)) => Some(cfg),
            _ => None,
        }
    }

    pub fn oauth2(&self) -> Option<&OAuth2Config> {
        match &self.oauth {
            Some(OAuthConfig::OAuth2(cfg)) => Some(cfg),
            _ => None,
        }
    }
}

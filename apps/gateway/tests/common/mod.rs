#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use hookgram_core::{
    DispatchContext, HandlerError, InMemoryStore, ServiceDescriptor, ServiceRegistry, StorePool,
    SubscriptionStore, WebhookHandler, WebhookRequest,
};
use hookgram_gateway::{AppState, GatewayConfig, build_router};
use http_body_util::BodyExt;
use tower::ServiceExt;

/// (service, chat id, user id) seen by a handler call.
pub type Call = (String, Option<i64>, Option<i64>);

/// Webhook handler that records every call and can be told to fail or flood
/// for a given chat.
#[derive(Default)]
pub struct Recorder {
    pub calls: Arc<Mutex<Vec<Call>>>,
    /// Credential and settings keys of the user each call observed.
    pub visible: Arc<Mutex<Vec<(Vec<String>, Vec<String>)>>>,
    pub fail_chat: Option<i64>,
    pub flood_chat: Option<i64>,
    pub panic: bool,
}

impl Recorder {
    pub fn shared(calls: &Arc<Mutex<Vec<Call>>>) -> Self {
        Self {
            calls: calls.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl WebhookHandler for Recorder {
    async fn handle(
        &self,
        ctx: &DispatchContext,
        _request: &WebhookRequest,
    ) -> Result<(), HandlerError> {
        if self.panic {
            panic!("handler blew up");
        }
        self.calls.lock().unwrap().push((
            ctx.service_name.clone().unwrap_or_default(),
            ctx.chat_id,
            ctx.user.as_ref().map(|u| u.id),
        ));
        if let Some(user) = &ctx.user {
            self.visible.lock().unwrap().push((
                user.protected.keys().cloned().collect(),
                user.settings.keys().cloned().collect(),
            ));
        }
        if ctx.chat_id.is_some() && ctx.chat_id == self.flood_chat {
            return Err(HandlerError::flood("Too Many Requests: retry after 5"));
        }
        if ctx.chat_id.is_some() && ctx.chat_id == self.fail_chat {
            return Err(HandlerError::failed(anyhow::anyhow!("chat refused")));
        }
        Ok(())
    }
}

pub struct Harness {
    pub router: Router,
    pub store: Arc<InMemoryStore>,
    pub raw_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        Self::with_config(services, |_| {})
    }

    pub fn with_config(
        services: Vec<ServiceDescriptor>,
        tweak: impl FnOnce(&mut GatewayConfig),
    ) -> Self {
        let raw_dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig {
            raw_dir: raw_dir.path().join("raw"),
            public_base_url: "https://hooks.example".into(),
            ..GatewayConfig::default()
        };
        tweak(&mut config);

        let store = Arc::new(InMemoryStore::new());
        let shared: Arc<dyn SubscriptionStore> = store.clone();
        let pool = StorePool::new(shared, 8);
        let registry = services
            .into_iter()
            .fold(ServiceRegistry::builder(), |builder, service| {
                builder.register(service)
            })
            .try_build()
            .unwrap();
        let state = AppState::new(config, Arc::new(registry), pool).unwrap();
        Self {
            router: build_router(state),
            store,
            raw_dir,
        }
    }

    pub fn from_state(state: AppState, store: Arc<InMemoryStore>) -> Self {
        Self {
            router: build_router(state),
            store,
            raw_dir: tempfile::tempdir().unwrap(),
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub fn dumps(&self) -> Vec<String> {
        match std::fs::read_dir(self.raw_dir.path().join("raw")) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_text(res: Response<Body>) -> String {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

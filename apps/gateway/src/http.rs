use std::any::Any;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use handlebars::Handlebars;
use hookgram_core::{ServiceRegistry, StorePool};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, warn};

use crate::config::GatewayConfig;
use crate::rate::RateLimitLayer;
use crate::reqid::{RequestId, with_request_id};
use crate::telegram::UpdateSink;
use crate::{oauth, telegram, webhook};

pub const OAUTH_REDIRECT_TEMPLATE: &str = "oauth_redirect";
const BROWSER_HINT: &str =
    "Hi here! This link isn't working in a browser. Please follow the instructions in the chat";
const PANIC_BODY: &str = "Oops. Something not good.";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub pool: StorePool,
    pub http: reqwest::Client,
    pub templates: Arc<Handlebars<'static>>,
    pub updates: Option<Arc<dyn UpdateSink>>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<ServiceRegistry>,
        pool: StorePool,
    ) -> anyhow::Result<Self> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        templates
            .register_template_string(
                OAUTH_REDIRECT_TEMPLATE,
                include_str!("../templates/oauth_redirect.hbs"),
            )
            .context("invalid oauth redirect template")?;
        Ok(Self {
            config: Arc::new(config),
            registry,
            pool,
            http: reqwest::Client::new(),
            templates: Arc::new(templates),
            updates: None,
        })
    }

    pub fn with_update_sink(mut self, sink: Arc<dyn UpdateSink>) -> Self {
        self.updates = Some(sink);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    let hooks = Router::new()
        .route(
            "/service/{service}",
            get(webhook::auto_detect).post(webhook::auto_detect),
        )
        .route(
            "/{token}",
            post(webhook::deliver)
                .head(webhook::probe)
                .get(not_found),
        )
        .route(
            "/{token}/{service}",
            post(webhook::deliver_with_service).get(not_found),
        )
        .route_layer(RateLimitLayer::new(state.config.rate_limits()));

    Router::new()
        .route("/oauth1/{id}", get(oauth::init))
        .route("/auth", get(oauth::callback))
        .route("/auth/{provider}", get(oauth::callback_with_provider))
        .route("/tg/{bot_id}", post(telegram::update))
        .merge(hooks)
        .fallback(not_found)
        .layer(middleware::from_fn(log_failures))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(with_request_id))
        .with_state(state)
}

/// Hook tokens are a scope letter plus a random suffix.
pub fn looks_like_hook_token(segment: &str) -> bool {
    segment.len() > 10 && matches!(segment.chars().next(), Some('c' | 'u' | 'h'))
}

async fn not_found(method: Method, uri: Uri) -> Response {
    let first = uri.path().split('/').find(|s| !s.is_empty()).unwrap_or("");
    if method == Method::GET && looks_like_hook_token(first) {
        (StatusCode::NOT_FOUND, BROWSER_HINT).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic payload".to_string()
    };
    error!(panic = %detail, "request handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, PANIC_BODY).into_response()
}

async fn log_failures(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|rid| rid.0.clone())
        .unwrap_or_default();

    let res = next.run(req).await;
    let status = res.status();
    if (status.is_client_error() || status.is_server_error()) && status != StatusCode::NOT_FOUND {
        warn!(
            %method,
            %path,
            %user_agent,
            %request_id,
            status = status.as_u16(),
            "request failed"
        );
    }
    res
}

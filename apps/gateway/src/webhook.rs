//! Hook token resolution and per-target dispatch for inbound deliveries.
//!
//! The first character of the token picks the search space: `u` resolves a
//! user, `c` (and the legacy `h`) a chat. A token-less delivery to
//! `/service/{name}` lets the service's token handler produce the targets.
//! Unknown tokens are dumped to disk and acknowledged without a body so that
//! senders never learn whether a token exists.

use std::collections::BTreeMap;
use std::path::{Path as FsPath, PathBuf};

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use hookgram_core::{
    ChatId, DispatchContext, DispatchKind, Hook, Query as StoreQuery, ServiceDescriptor,
    TargetQuery, TokenScope, WebhookRequest, scope_to_hook,
};
use hookgram_telemetry::{TelemetryLabels, delivery_span, record_counter};
use time::OffsetDateTime;
use tracing::{Instrument, debug, error, warn};

use crate::http::AppState;
use crate::reqid::RequestId;

const DELIVERIES: &str = "hookgram_deliveries_total";
const AUTO_DETECT_PLACEHOLDER: &str = "service";
const MAX_DUMP_TOKEN_LEN: usize = 64;

/// How a delivery ended, mapped onto the HTTP answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Routed; acknowledged regardless of per-target success.
    Acknowledged,
    /// Nothing to do or token unknown; bodiless 200.
    Dropped,
    /// A handler reported that the receiving side is rate limiting.
    Flood(String),
    NotFound,
    StoreUnavailable,
}

impl IntoResponse for DeliveryOutcome {
    fn into_response(self) -> Response {
        match self {
            DeliveryOutcome::Acknowledged | DeliveryOutcome::Dropped => StatusCode::OK.into_response(),
            DeliveryOutcome::Flood(message) => {
                (StatusCode::TOO_MANY_REQUESTS, message).into_response()
            }
            DeliveryOutcome::NotFound => StatusCode::NOT_FOUND.into_response(),
            DeliveryOutcome::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        }
    }
}

pub async fn deliver(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Extension(rid): Extension<RequestId>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> DeliveryOutcome {
    let request = webhook_request(&rid, method, headers, query, body);
    route_delivery(&state, &rid, &token, None, request).await
}

pub async fn deliver_with_service(
    State(state): State<AppState>,
    Path((token, service)): Path<(String, String)>,
    Extension(rid): Extension<RequestId>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> DeliveryOutcome {
    let request = webhook_request(&rid, method, headers, query, body);
    route_delivery(&state, &rid, &token, Some(&service), request).await
}

pub async fn auto_detect(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Extension(rid): Extension<RequestId>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> DeliveryOutcome {
    let request = webhook_request(&rid, method, headers, query, body);
    route_delivery(&state, &rid, "", Some(&service), request).await
}

/// Providers probe webhook URLs with HEAD before registering them.
pub async fn probe() -> StatusCode {
    StatusCode::OK
}

fn webhook_request(
    rid: &RequestId,
    method: Method,
    headers: HeaderMap,
    query: BTreeMap<String, String>,
    body: Bytes,
) -> WebhookRequest {
    WebhookRequest {
        request_id: rid.0.clone(),
        method,
        headers,
        query,
        body,
    }
}

/// Resolves `token` (or the service's token handler) to targets and runs the
/// matching webhook handlers strictly in stored order.
pub async fn route_delivery(
    state: &AppState,
    rid: &RequestId,
    token: &str,
    service: Option<&str>,
    request: WebhookRequest,
) -> DeliveryOutcome {
    let span = delivery_span(&rid.0, token, service);
    async move {
        let store = match state.pool.acquire().await {
            Ok(store) => store,
            Err(err) => {
                error!(error = %err, "no store handle for delivery");
                return DeliveryOutcome::StoreUnavailable;
            }
        };
        let root = DispatchContext::new(store, rid.0.as_str(), state.config.public_base_url.as_str());

        if let Some(service) = service {
            if token.is_empty() || token == AUTO_DETECT_PLACEHOLDER {
                return auto_detect_delivery(state, root, service, &request).await;
            }
        }
        let root = match service {
            Some(service) => root.with_service(service),
            None => root,
        };

        match TokenScope::of(token) {
            Some(TokenScope::User) => user_delivery(state, root, token, rid, &request).await,
            Some(TokenScope::Chat) => chat_delivery(state, root, token, rid, &request).await,
            None => DeliveryOutcome::NotFound,
        }
    }
    .instrument(span)
    .await
}

async fn auto_detect_delivery(
    state: &AppState,
    root: DispatchContext,
    service: &str,
    request: &WebhookRequest,
) -> DeliveryOutcome {
    let Some(descriptor) = state.registry.get(service) else {
        debug!(service, "auto-detect delivery for unknown service");
        return DeliveryOutcome::Dropped;
    };
    let ctx = root.with_service(descriptor.name.clone());
    let Some(token_handler) = descriptor.token_handler.clone() else {
        return DeliveryOutcome::Dropped;
    };

    let target = match token_handler.resolve(&ctx, request).await {
        Ok(Some(target)) => target,
        Ok(None) => return DeliveryOutcome::Dropped,
        Err(err) => {
            error!(service, error = %err, "token handler error");
            return DeliveryOutcome::Dropped;
        }
    };

    let targets: Vec<DispatchContext> = match target {
        TargetQuery::Chats(query) => match ctx.store().find_chats(&query).await {
            Ok(chats) => chats.iter().map(|chat| ctx.for_chat(chat.id)).collect(),
            Err(err) => {
                error!(service, error = %err, "auto-detect chat lookup failed");
                Vec::new()
            }
        },
        TargetQuery::Users(query) => match ctx.store().find_users(&query).await {
            Ok(users) => users.into_iter().map(|user| ctx.for_user(user)).collect(),
            Err(err) => {
                error!(service, error = %err, "auto-detect user lookup failed");
                Vec::new()
            }
        },
    };

    let mut handled = false;
    for child in targets {
        match run_handler(&descriptor, &child, request).await {
            Ok(()) => handled = true,
            Err(Some(message)) => return DeliveryOutcome::Flood(message),
            Err(None) => {}
        }
    }
    if !handled {
        warn!(service, "hook not handled");
    }
    DeliveryOutcome::Acknowledged
}

async fn user_delivery(
    state: &AppState,
    root: DispatchContext,
    token: &str,
    rid: &RequestId,
    request: &WebhookRequest,
) -> DeliveryOutcome {
    let user = match root.store().find_user(&StoreQuery::hook_token(token)).await {
        Ok(Some(user)) if user.id > 0 => Some(user),
        Ok(_) => None,
        Err(err) => {
            error!(token, error = %err, "user lookup failed");
            None
        }
    };
    let Some((user, hook)) = user.and_then(|user| {
        let hook = user.hook(token).cloned()?;
        Some((user, hook))
    }) else {
        return unknown_token(state, TokenScope::User, token, rid, request).await;
    };

    let mut ctx = root.with_user(scope_to_hook(user, &hook));
    if let [only] = hook.services.as_slice() {
        ctx = ctx.with_service(only.clone());
    }
    dispatch_hook(state, ctx, &hook, request).await
}

async fn chat_delivery(
    state: &AppState,
    root: DispatchContext,
    token: &str,
    rid: &RequestId,
    request: &WebhookRequest,
) -> DeliveryOutcome {
    let chat = match root.store().find_chat(&StoreQuery::hook_token(token)).await {
        Ok(Some(chat)) if chat.id != 0 => Some(chat),
        Ok(_) => None,
        Err(err) => {
            error!(token, error = %err, "chat lookup failed");
            None
        }
    };
    let Some((chat_id, hook)) = chat.and_then(|chat| Some((chat.id, chat.hook(token).cloned()?)))
    else {
        return unknown_token(state, TokenScope::Chat, token, rid, request).await;
    };

    dispatch_hook(state, root.with_chat(chat_id), &hook, request).await
}

/// Runs every (service, chat) pair of `hook` in stored order. A flood error
/// stops the loop; other failures are logged and skipped.
async fn dispatch_hook(
    state: &AppState,
    ctx: DispatchContext,
    hook: &Hook,
    request: &WebhookRequest,
) -> DeliveryOutcome {
    record_counter(
        DELIVERIES,
        1,
        &TelemetryLabels::default()
            .with_scope(hook.scope().map(TokenScope::as_str).unwrap_or("unknown"))
            .with_outcome("resolved"),
    );
    let mut handled = false;
    for service_name in &hook.services {
        let Some(descriptor) = state.registry.get(service_name) else {
            debug!(token = %hook.token, service = %service_name, "hook names unregistered service");
            continue;
        };
        let targets = target_chats(hook, &ctx);
        if targets.is_empty() {
            warn!(token = %hook.token, service = %service_name, "no target chats for token");
            continue;
        }
        let service_ctx = ctx.clone().with_service(service_name.clone());
        for chat_id in targets {
            let child = service_ctx.for_chat(chat_id);
            match run_handler(&descriptor, &child, request).await {
                Ok(()) => handled = true,
                Err(Some(message)) => return DeliveryOutcome::Flood(message),
                Err(None) => {}
            }
        }
    }
    if !handled {
        warn!(token = %hook.token, "hook not handled");
    }
    DeliveryOutcome::Acknowledged
}

/// `Err(Some(text))` signals a flood, `Err(None)` any other failure.
async fn run_handler(
    descriptor: &ServiceDescriptor,
    ctx: &DispatchContext,
    request: &WebhookRequest,
) -> Result<(), Option<String>> {
    let result = descriptor.webhook.handle(ctx, request).await;
    let kind = DispatchKind::of(&result);
    count(&descriptor.name, kind.as_str());
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(
                service = %descriptor.name,
                chat_id = ?ctx.chat_id,
                error = %err,
                "webhook handler returned error"
            );
            Err((kind == DispatchKind::Flood).then(|| err.to_string()))
        }
    }
}

fn target_chats(hook: &Hook, ctx: &DispatchContext) -> Vec<ChatId> {
    if hook.chats.is_empty() {
        ctx.target_chat().into_iter().collect()
    } else {
        hook.chats.clone()
    }
}

async fn unknown_token(
    state: &AppState,
    scope: TokenScope,
    token: &str,
    rid: &RequestId,
    request: &WebhookRequest,
) -> DeliveryOutcome {
    record_counter(
        DELIVERIES,
        1,
        &TelemetryLabels::default()
            .with_scope(scope.as_str())
            .with_outcome("unknown_token"),
    );
    match dump_raw(&state.config.raw_dir, token, rid, &request.body).await {
        Ok(path) => error!(token, scope = scope.as_str(), dump = %path.display(), "unknown hook token"),
        Err(err) => error!(token, scope = scope.as_str(), error = %err, "unknown hook token; raw dump failed"),
    }
    DeliveryOutcome::Dropped
}

/// Writes the delivery body to `{dir}/{token}_{unix}_{rid}.json`.
pub async fn dump_raw(
    dir: &FsPath,
    token: &str,
    rid: &RequestId,
    body: &[u8],
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!(
        "{}_{}_{}.json",
        sanitize_token(token),
        OffsetDateTime::now_utc().unix_timestamp(),
        rid.prefix()
    ));
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

fn sanitize_token(token: &str) -> String {
    token
        .chars()
        .take(MAX_DUMP_TOKEN_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn count(service: &str, outcome: &str) {
    record_counter(
        DELIVERIES,
        1,
        &TelemetryLabels::service(service).with_outcome(outcome),
    );
}

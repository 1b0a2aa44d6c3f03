//! Browser legs of the OAuth flows: the OAuth1 redirect page and the shared
//! provider callback that stores credentials and returns the user to the bot.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use hookgram_core::{
    AccessGrant, DispatchContext, OAuthCorrelation, OAuthProviderRecord, ServiceDescriptor,
    UserData,
    oauth::{OAuth1Client, OAuth2Client, callback_url},
};
use hookgram_telemetry::{TelemetryLabels, record_counter};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use url::Url;

use crate::http::{AppState, OAUTH_REDIRECT_TEMPLATE};

const OAUTH_TOTAL: &str = "hookgram_oauth_total";

#[derive(Debug)]
pub enum OAuthFailure {
    Forbidden(String),
    NotImplemented(&'static str),
    Internal(&'static str),
    Unavailable(&'static str),
}

impl IntoResponse for OAuthFailure {
    fn into_response(self) -> Response {
        match self {
            OAuthFailure::Forbidden(message) => (StatusCode::FORBIDDEN, message).into_response(),
            OAuthFailure::NotImplemented(message) => {
                (StatusCode::NOT_IMPLEMENTED, message).into_response()
            }
            OAuthFailure::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
            OAuthFailure::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
            }
        }
    }
}

fn forbidden(message: impl Into<String>) -> OAuthFailure {
    OAuthFailure::Forbidden(message.into())
}

/// `GET /oauth1/{id}`: fetches OAuth1 request credentials and serves the page
/// that reports the browser timezone before redirecting to the provider.
/// A request carrying `tz` only records the timezone.
pub async fn init(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Response, OAuthFailure> {
    let store = state
        .pool
        .acquire()
        .await
        .map_err(|_| OAuthFailure::Unavailable("Store unavailable"))?;
    let record = live_correlation(&state, &store, &id)
        .await
        .filter(|record| record.user_id > 0)
        .ok_or_else(|| forbidden("Error occurred: can't find user"))?;

    if let Some(tz) = query.get("tz").filter(|tz| !tz.is_empty()) {
        if let Err(err) = store.set_user_tz(record.user_id, tz).await {
            error!(user_id = record.user_id, error = %err, "failed to store timezone");
        }
        return Ok(StatusCode::OK.into_response());
    }

    let descriptor = state
        .registry
        .get(&record.service)
        .ok_or(OAuthFailure::Internal("Error occurred: unknown service"))?;
    let Some(config) = descriptor.oauth1() else {
        return Err(OAuthFailure::NotImplemented("Redirect is for OAuth1 only"));
    };

    let base_url = if record.val.base_url.is_empty() {
        descriptor.base_url.clone()
    } else {
        record.val.base_url.clone()
    };
    if Url::parse(&base_url).is_err() {
        error!(service = %descriptor.name, %base_url, "bad provider base url");
        return Err(OAuthFailure::Internal("Error occurred"));
    }

    let provider = init_provider(&state, &store, &descriptor, &base_url).await;
    let callback = format!(
        "{}?state={}",
        callback_url(&state.config.public_base_url, &provider),
        id
    );
    let client = OAuth1Client::for_provider(state.http.clone(), config, &provider).map_err(|err| {
        error!(service = %descriptor.name, error = %err, "invalid oauth1 endpoints");
        OAuthFailure::Internal("Error occurred")
    })?;
    let (request_token, authorize) = client.request_token(&callback).await.map_err(|err| {
        error!(service = %descriptor.name, error = %err, "oauth1 request token failed");
        OAuthFailure::Unavailable("Error getting OAuth request URL")
    })?;

    match store.set_request_token(&id, &request_token).await {
        Ok(true) => {}
        Ok(false) => warn!(%id, "correlation vanished before storing request token"),
        Err(err) => error!(%id, error = %err, "failed to store request token"),
    }

    let page = state
        .templates
        .render(
            OAUTH_REDIRECT_TEMPLATE,
            &json!({
                "target": authorize.as_str(),
                "url_json": script_string(authorize.as_str()),
            }),
        )
        .map_err(|err| {
            error!(error = %err, "oauth redirect template failed");
            OAuthFailure::Internal("Error occurred")
        })?;
    Ok(Html(page).into_response())
}

/// Provider record used to start the flow: the service default when the base
/// URL matches, otherwise a stored self-hosted provider.
async fn init_provider(
    state: &AppState,
    store: &hookgram_core::StoreHandle,
    descriptor: &ServiceDescriptor,
    base_url: &str,
) -> OAuthProviderRecord {
    let default = state
        .registry
        .default_provider(&descriptor.name)
        .unwrap_or_else(|| OAuthProviderRecord::new(&descriptor.name, &descriptor.base_url));
    if default.base_url.trim_end_matches('/') == base_url.trim_end_matches('/') {
        return default;
    }
    let candidate = OAuthProviderRecord::new(&descriptor.name, base_url);
    match store.get_oauth_provider(&candidate.internal_id()).await {
        Ok(Some(stored)) => stored,
        Ok(None) => candidate.with_credentials(default.client_id, default.client_secret),
        Err(err) => {
            error!(service = %descriptor.name, error = %err, "provider lookup failed");
            candidate.with_credentials(default.client_id, default.client_secret)
        }
    }
}

/// JSON string literal safe to embed inside a `<script>` block.
fn script_string(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace('<', "\\u003c")
}

/// `GET /auth?state=…`
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Response, OAuthFailure> {
    let provider_id = query.get("provider").cloned();
    complete(state, provider_id, query).await
}

/// `GET /auth/{provider}?state=…`
pub async fn callback_with_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Response, OAuthFailure> {
    complete(state, Some(provider), query).await
}

async fn complete(
    state: AppState,
    provider_id: Option<String>,
    query: BTreeMap<String, String>,
) -> Result<Response, OAuthFailure> {
    let store = state
        .pool
        .acquire()
        .await
        .map_err(|_| OAuthFailure::Unavailable("Store unavailable"))?;
    let ephemeral_id = non_empty(&query, "u")
        .or_else(|| non_empty(&query, "state"))
        .unwrap_or_default()
        .to_string();
    let record = live_correlation(&state, &store, &ephemeral_id)
        .await
        .filter(|record| record.user_id > 0)
        .ok_or_else(|| forbidden("Unknown or expired authorization"))?;

    let provider = match provider_id.filter(|id| !id.is_empty()) {
        Some(id) => match state.registry.default_provider_by_id(&id) {
            Some(provider) => Some(provider),
            None => store.get_oauth_provider(&id).await.unwrap_or_else(|err| {
                error!(provider = %id, error = %err, "provider lookup failed");
                None
            }),
        },
        None => state.registry.default_provider(&record.service),
    };
    let Some(provider) = provider else {
        error!(service = %record.service, "no oauth provider for callback");
        return Err(OAuthFailure::Internal("Error occured"));
    };
    if provider.service != record.service {
        warn!(
            expected = %record.service,
            got = %provider.service,
            "oauth callback provider mismatch"
        );
        return Err(forbidden("Provider mismatch"));
    }
    let descriptor = state
        .registry
        .get(&record.service)
        .ok_or(OAuthFailure::Internal("Error occured"))?;

    let user = match store.get_user(record.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => UserData::new(record.user_id),
        Err(err) => {
            error!(user_id = record.user_id, error = %err, "user lookup failed");
            UserData::new(record.user_id)
        }
    };
    let ctx = DispatchContext::new(
        store,
        hookgram_core::random_id(10),
        state.config.public_base_url.as_str(),
    )
    .with_service(descriptor.name.clone())
    .with_user(user)
    .with_chat(record.user_id);

    let grant = exchange(&state, &ctx, &descriptor, &provider, &record, &query).await?;
    if grant.access_token.is_empty() {
        return Err(forbidden("Access token is empty"));
    }

    let service = descriptor.name.clone();
    let stored = grant.clone();
    if let Err(err) = ctx
        .store()
        .update_user(
            record.user_id,
            Box::new(move |user| {
                let entry = user.protected.entry(service).or_default();
                entry.oauth_token = stored.access_token;
                if let Some(secret) = stored.token_secret {
                    entry.oauth_token_secret = Some(secret);
                }
                if let Some(refresh) = stored.refresh_token {
                    entry.oauth_refresh_token = Some(refresh);
                }
                if let Some(expires_at) = stored.expires_at {
                    entry.oauth_expire_date = Some(expires_at);
                }
            }),
        )
        .await
    {
        error!(user_id = record.user_id, error = %err, "failed to store oauth credentials");
    }
    info!(user_id = record.user_id, service = %descriptor.name, "oauth authorization stored");
    record_counter(
        OAUTH_TOTAL,
        1,
        &TelemetryLabels::service(&descriptor.name).with_outcome("authorized"),
    );

    if let Some(handler) = descriptor.on_oauth_success.clone() {
        spawn_success(&state, &descriptor.name, record.user_id, handler);
    }

    let link = state.config.bot_link(&descriptor.bot_username);
    Ok((StatusCode::FOUND, [(header::LOCATION, link)]).into_response())
}

async fn exchange(
    state: &AppState,
    ctx: &DispatchContext,
    descriptor: &ServiceDescriptor,
    provider: &OAuthProviderRecord,
    record: &OAuthCorrelation,
    query: &BTreeMap<String, String>,
) -> Result<AccessGrant, OAuthFailure> {
    let deny = |reason: String| denied(&descriptor.name, reason);

    if let Some(config) = descriptor.oauth2() {
        if let Some(receiver) = &config.receiver {
            return receiver.receive(ctx, query).await.map_err(|err| deny(err.to_string()));
        }
        let Some(code) = non_empty(query, "code") else {
            let reason = non_empty(query, "error_description")
                .or_else(|| non_empty(query, "error"))
                .unwrap_or("OAuth2 code is empty");
            return Err(forbidden(reason));
        };
        let redirect = callback_url(&state.config.public_base_url, provider);
        let client = OAuth2Client::for_provider(state.http.clone(), config, provider, redirect)
            .map_err(|err| deny(err.to_string()))?;
        return client.exchange(code).await.map_err(|err| deny(err.to_string()));
    }

    if let Some(config) = descriptor.oauth1() {
        let Some(request_token) = record.val.request_token.as_ref() else {
            return Err(forbidden("OAuth1 request token is missing"));
        };
        if let Some(receiver) = &config.receiver {
            return receiver
                .receive(ctx, query, request_token)
                .await
                .map_err(|err| deny(err.to_string()));
        }
        let Some(verifier) = non_empty(query, "oauth_verifier") else {
            return Err(forbidden("OAuth1 verifier is empty"));
        };
        let client = OAuth1Client::for_provider(state.http.clone(), config, provider)
            .map_err(|err| deny(err.to_string()))?;
        return client
            .access_token(request_token, verifier)
            .await
            .map_err(|err| deny(err.to_string()));
    }

    Err(forbidden("Service has no OAuth configuration"))
}

fn denied(service: &str, reason: String) -> OAuthFailure {
    warn!(%service, error = %reason, "oauth exchange failed");
    record_counter(
        OAUTH_TOTAL,
        1,
        &TelemetryLabels::service(service).with_outcome("denied"),
    );
    OAuthFailure::Forbidden(reason)
}

fn non_empty<'a>(query: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    query.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

async fn live_correlation(
    state: &AppState,
    store: &hookgram_core::StoreHandle,
    ephemeral_id: &str,
) -> Option<OAuthCorrelation> {
    if ephemeral_id.is_empty() {
        return None;
    }
    match store.get_correlation(ephemeral_id).await {
        Ok(Some(record)) if !record.is_expired(OffsetDateTime::now_utc(), state.config.oauth_ttl) => {
            Some(record)
        }
        Ok(_) => None,
        Err(err) => {
            error!(%ephemeral_id, error = %err, "correlation lookup failed");
            None
        }
    }
}

/// Runs the post-authorization job detached from the request with its own
/// store handle.
fn spawn_success(
    state: &AppState,
    service: &str,
    user_id: i64,
    handler: std::sync::Arc<dyn hookgram_core::OAuthSuccessHandler>,
) {
    let pool = state.pool.clone();
    let public_base_url = state.config.public_base_url.clone();
    let service = service.to_string();
    tokio::spawn(async move {
        let store = match pool.acquire().await {
            Ok(store) => store,
            Err(err) => {
                error!(%service, error = %err, "no store handle for oauth success job");
                return;
            }
        };
        let user = match store.get_user(user_id).await {
            Ok(user) => user.unwrap_or_else(|| UserData::new(user_id)),
            Err(err) => {
                error!(%service, user_id, error = %err, "user lookup failed");
                UserData::new(user_id)
            }
        };
        let ctx = DispatchContext::new(store, hookgram_core::random_id(10), public_base_url)
            .with_service(service.clone())
            .with_user(user)
            .with_chat(user_id);
        if let Err(err) = handler.on_success(ctx).await {
            error!(%service, user_id, error = %err, "oauth success handler failed");
        }
    });
}

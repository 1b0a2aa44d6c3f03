//! Fan-out of internally triggered notifications (polling results, scheduled
//! jobs) to the users or chats matching a store query.

use std::sync::Arc;

use hookgram_telemetry::{TelemetryLabels, record_counter};
use serde_json::Value;
use tracing::{error, warn};

use crate::context::DispatchContext;
use crate::model::random_id;
use crate::registry::ServiceRegistry;
use crate::service::{DispatchKind, ServiceDescriptor, TargetQuery};
use crate::store::StorePool;

const REQUEST_ID_LEN: usize = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("service {0} is not registered")]
    UnknownService(String),
    #[error("service {0} has no event handler")]
    MissingEventHandler(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventReport {
    pub matched: usize,
    pub handled: usize,
    pub failed: usize,
}

/// Entry point services use to push events without an inbound request.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: Arc<ServiceRegistry>,
    pool: StorePool,
    public_base_url: Arc<str>,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        pool: StorePool,
        public_base_url: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            registry,
            pool,
            public_base_url: public_base_url.into(),
        }
    }

    pub async fn trigger(
        &self,
        service: &str,
        target: Option<TargetQuery>,
        payload: &Value,
    ) -> Result<EventReport, ConfigurationError> {
        let descriptor = self
            .registry
            .get(service)
            .ok_or_else(|| ConfigurationError::UnknownService(service.to_string()))?;
        trigger_event(
            &descriptor,
            &self.pool,
            &self.public_base_url,
            target,
            payload,
        )
        .await
    }
}

/// Invokes the service's event handler once per matching user or chat, each
/// with a fresh context. Per-target and lookup errors are logged and never
/// abort the remaining targets.
pub async fn trigger_event(
    descriptor: &ServiceDescriptor,
    pool: &StorePool,
    public_base_url: &str,
    target: Option<TargetQuery>,
    payload: &Value,
) -> Result<EventReport, ConfigurationError> {
    let handler = descriptor
        .event_handler
        .clone()
        .ok_or_else(|| ConfigurationError::MissingEventHandler(descriptor.name.clone()))?;
    let mut report = EventReport::default();
    let Some(target) = target else {
        return Ok(report);
    };

    let store = match pool.acquire().await {
        Ok(store) => store,
        Err(err) => {
            error!(service = %descriptor.name, error = %err, "event fan-out could not acquire store");
            return Ok(report);
        }
    };
    let root = DispatchContext::new(store, random_id(REQUEST_ID_LEN), public_base_url)
        .with_service(descriptor.name.clone());

    let contexts: Vec<DispatchContext> = match &target {
        TargetQuery::Chats(query) => match root.store().find_chats(query).await {
            Ok(chats) => chats.iter().map(|chat| root.for_chat(chat.id)).collect(),
            Err(err) => {
                error!(service = %descriptor.name, error = %err, "event chat lookup failed");
                Vec::new()
            }
        },
        TargetQuery::Users(query) => match root.store().find_users(query).await {
            Ok(users) => users.into_iter().map(|user| root.for_user(user)).collect(),
            Err(err) => {
                error!(service = %descriptor.name, error = %err, "event user lookup failed");
                Vec::new()
            }
        },
    };

    report.matched = contexts.len();
    for ctx in contexts {
        let result = handler.handle(&ctx, payload).await;
        let kind = DispatchKind::of(&result);
        match result {
            Ok(()) => report.handled += 1,
            Err(err) => {
                report.failed += 1;
                warn!(
                    service = %descriptor.name,
                    chat_id = ?ctx.chat_id,
                    error = %err,
                    "event handler returned error"
                );
            }
        }
        record_counter(
            "hookgram_events_total",
            1,
            &TelemetryLabels::service(descriptor.name.clone()).with_outcome(kind.as_str()),
        );
    }
    Ok(report)
}


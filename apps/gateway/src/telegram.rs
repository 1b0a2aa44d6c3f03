//! Entry point for Telegram bot updates. Processing of the update itself is
//! delegated to an [`UpdateSink`]; this module only authenticates the call.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use hookgram_security::{constant_time_eq, telegram_webhook_secret};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::BotConfig;
use crate::http::AppState;

#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn deliver(&self, bot: &BotConfig, update: Value) -> anyhow::Result<()>;
}

/// `POST /tg/{bot_id}?secret=…`
pub async fn update(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let Some(bot) = bot_id
        .parse::<i64>()
        .ok()
        .and_then(|id| state.config.bot(id))
    else {
        warn!(%bot_id, "update for unknown bot");
        return StatusCode::FORBIDDEN;
    };

    let expected = telegram_webhook_secret(&bot.token);
    let given = query.get("secret").map(String::as_str).unwrap_or_default();
    if !constant_time_eq(given, &expected) {
        warn!(bot_id = bot.id, "telegram update with bad secret");
        return StatusCode::FORBIDDEN;
    }

    let update: Value = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(err) => {
            warn!(bot_id = bot.id, error = %err, "telegram update is not json");
            return StatusCode::BAD_REQUEST;
        }
    };

    match &state.updates {
        Some(sink) => {
            if let Err(err) = sink.deliver(bot, update).await {
                error!(bot_id = bot.id, error = %err, "update sink failed");
            }
        }
        None => info!(bot_id = bot.id, "telegram update received without sink"),
    }
    StatusCode::OK
}

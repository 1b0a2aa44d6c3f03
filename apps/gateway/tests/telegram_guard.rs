mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::StatusCode;
use common::{Harness, post};
use hookgram_core::{InMemoryStore, ServiceRegistry, StorePool};
use hookgram_gateway::{AppState, BotConfig, GatewayConfig, UpdateSink};
use hookgram_security::telegram_webhook_secret;
use serde_json::Value;

#[derive(Default)]
struct Collect(Mutex<Vec<(i64, Value)>>);

#[async_trait]
impl UpdateSink for Collect {
    async fn deliver(&self, bot: &BotConfig, update: Value) -> anyhow::Result<()> {
        self.0.lock().unwrap().push((bot.id, update));
        Ok(())
    }
}

fn harness(sink: Arc<Collect>) -> Harness {
    let config = GatewayConfig {
        bots: vec![BotConfig {
            id: 123,
            token: "123:SECRET".into(),
            username: "hook_bot".into(),
        }],
        ..GatewayConfig::default()
    };
    let store = Arc::new(InMemoryStore::new());
    let pool = StorePool::new(store.clone(), 2);
    let state = AppState::new(config, Arc::new(ServiceRegistry::builder().build()), pool)
        .unwrap()
        .with_update_sink(sink);
    Harness::from_state(state, store)
}

#[tokio::test]
async fn valid_secret_reaches_sink() {
    let sink = Arc::new(Collect::default());
    let harness = harness(sink.clone());
    let secret = telegram_webhook_secret("123:SECRET");

    let res = harness
        .send(post(
            &format!("/tg/123?secret={secret}"),
            r#"{"update_id":1,"message":{"text":"/start"}}"#,
        ))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let seen = sink.0.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, 123);
    assert_eq!(seen[0].1["update_id"], 1);
}

#[tokio::test]
async fn wrong_secret_or_bot_is_forbidden() {
    let sink = Arc::new(Collect::default());
    let harness = harness(sink.clone());
    let secret = telegram_webhook_secret("123:SECRET");

    let res = harness.send(post("/tg/123?secret=guess", "{}")).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let res = harness.send(post("/tg/123", "{}")).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let res = harness
        .send(post(&format!("/tg/999?secret={secret}"), "{}"))
        .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let res = harness
        .send(post(&format!("/tg/abc?secret={secret}"), "{}"))
        .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert!(sink.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_update_is_bad_request() {
    let sink = Arc::new(Collect::default());
    let harness = harness(sink.clone());
    let secret = telegram_webhook_secret("123:SECRET");

    let res = harness
        .send(post(&format!("/tg/123?secret={secret}"), "not json"))
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(sink.0.lock().unwrap().is_empty());
}

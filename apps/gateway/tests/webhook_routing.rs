mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{Method, Request, StatusCode};
use axum::body::Body;
use common::{Call, Harness, Recorder, body_text, get, post};
use hookgram_core::{
    ChatData, DispatchContext, Hook, ProtectedSettings, Query, ServiceDescriptor,
    SubscriptionStore, TargetQuery, TokenHandler, UserData, WebhookRequest,
};
use serde_json::json;

fn service(name: &str, recorder: Recorder) -> ServiceDescriptor {
    ServiceDescriptor::new(name, Arc::new(recorder))
}

fn calls() -> Arc<Mutex<Vec<Call>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn seen(calls: &Arc<Mutex<Vec<Call>>>) -> Vec<Call> {
    calls.lock().unwrap().clone()
}

#[tokio::test]
async fn chat_hook_fans_out_services_then_chats_in_order() {
    let log = calls();
    let harness = Harness::new(vec![
        service("a", Recorder::shared(&log)),
        service("b", Recorder::shared(&log)),
    ]);
    let mut chat = ChatData::new(-5);
    chat.hooks.push(
        Hook::with_token("cFanOutToken1")
            .with_service("a")
            .with_service("b")
            .with_chat(10)
            .with_chat(20),
    );
    harness.store.save_chat(chat).await.unwrap();

    let res = harness.send(post("/cFanOutToken1", "{}")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));
    assert_eq!(
        seen(&log),
        vec![
            ("a".to_string(), Some(10), None),
            ("a".to_string(), Some(20), None),
            ("b".to_string(), Some(10), None),
            ("b".to_string(), Some(20), None),
        ]
    );
}

#[tokio::test]
async fn chat_hook_without_chats_targets_owning_chat() {
    let log = calls();
    let harness = Harness::new(vec![service("a", Recorder::shared(&log))]);
    let mut chat = ChatData::new(-42);
    chat.hooks.push(Hook::with_token("cOwnChatTok1").with_service("a"));
    harness.store.save_chat(chat).await.unwrap();

    let res = harness.send(post("/cOwnChatTok1", "{}")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(seen(&log), vec![("a".to_string(), Some(-42), None)]);
}

#[tokio::test]
async fn token_prefix_selects_search_space() {
    let log = calls();
    let harness = Harness::new(vec![service("a", Recorder::shared(&log))]);
    // A user-prefixed token stored on a chat is never resolved through chats.
    let mut chat = ChatData::new(-7);
    chat.hooks.push(Hook::with_token("uMisplaced01").with_service("a"));
    harness.store.save_chat(chat).await.unwrap();

    let res = harness.send(post("/uMisplaced01", "{}")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_text(res).await, "");
    assert!(seen(&log).is_empty());
    assert_eq!(harness.dumps().len(), 1);
}

#[tokio::test]
async fn user_hook_is_scoped_to_its_services() {
    let log = calls();
    let recorder = Recorder::shared(&log);
    let visible = recorder.visible.clone();
    let harness = Harness::new(vec![service("trello", recorder)]);
    let mut user = UserData::new(42);
    user.hooks.push(
        Hook::with_token("uUserHook001")
            .with_service("trello")
            .with_chat(42),
    );
    user.hooks.push(Hook::with_token("uUserHook002").with_service("gmail"));
    for name in ["trello", "gmail"] {
        user.protected.insert(
            name.into(),
            ProtectedSettings {
                oauth_token: format!("{name}-token"),
                ..Default::default()
            },
        );
        user.settings.insert(name.into(), json!({"on": true}));
    }
    harness.store.save_user(user).await.unwrap();

    let res = harness.send(post("/uUserHook001", "{}")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(seen(&log), vec![("trello".to_string(), Some(42), Some(42))]);
    assert_eq!(
        visible.lock().unwrap().clone(),
        vec![(vec!["trello".to_string()], vec!["trello".to_string()])]
    );

    let stored = harness.store.get_user(42).await.unwrap().unwrap();
    assert_eq!(stored.protected.len(), 2);
    assert_eq!(stored.hooks.len(), 2);
}

#[tokio::test]
async fn user_hook_without_target_chats_dispatches_nothing() {
    let log = calls();
    let harness = Harness::new(vec![service("a", Recorder::shared(&log))]);
    let mut user = UserData::new(43);
    user.hooks.push(Hook::with_token("uNoTargets01").with_service("a"));
    harness.store.save_user(user).await.unwrap();

    let res = harness.send(post("/uNoTargets01", "{}")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(seen(&log).is_empty());
}

#[tokio::test]
async fn flood_stops_dispatch_with_429() {
    let log = calls();
    let harness = Harness::new(vec![
        service(
            "a",
            Recorder {
                calls: log.clone(),
                flood_chat: Some(10),
                ..Default::default()
            },
        ),
        service("b", Recorder::shared(&log)),
    ]);
    let mut chat = ChatData::new(-5);
    chat.hooks.push(
        Hook::with_token("cFloodToken1")
            .with_service("a")
            .with_service("b")
            .with_chat(10)
            .with_chat(20),
    );
    harness.store.save_chat(chat).await.unwrap();

    let res = harness.send(post("/cFloodToken1", "{}")).await;
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(body_text(res).await.contains("Too Many Requests"));
    assert_eq!(seen(&log), vec![("a".to_string(), Some(10), None)]);
}

#[tokio::test]
async fn failing_target_does_not_stop_the_rest() {
    let log = calls();
    let harness = Harness::new(vec![service(
        "a",
        Recorder {
            calls: log.clone(),
            fail_chat: Some(10),
            ..Default::default()
        },
    )]);
    let mut chat = ChatData::new(-5);
    chat.hooks.push(
        Hook::with_token("cPartialTok1")
            .with_service("a")
            .with_chat(10)
            .with_chat(20),
    );
    harness.store.save_chat(chat).await.unwrap();

    let res = harness.send(post("/cPartialTok1", "{}")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(seen(&log).len(), 2);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn unknown_tokens_are_dumped_and_acknowledged() {
    let harness = Harness::new(vec![]);

    for _ in 0..2 {
        let res = harness.send(post("/cDoesNotExist", "{\"n\":1}")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_text(res).await, "");
    }
    let dumps = harness.dumps();
    assert_eq!(dumps.len(), 2);
    assert!(dumps.iter().all(|name| name.starts_with("cDoesNotExist_")));
    assert!(logs_contain("unknown hook token"));
}

#[tokio::test]
async fn unknown_scope_letter_is_not_found() {
    let harness = Harness::new(vec![]);
    let res = harness.send(post("/xWhatever123", "{}")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert!(harness.dumps().is_empty());
}

#[tokio::test]
async fn unregistered_services_are_skipped() {
    let log = calls();
    let harness = Harness::new(vec![service("b", Recorder::shared(&log))]);
    let mut chat = ChatData::new(-9);
    chat.hooks.push(
        Hook::with_token("cSkipGone001")
            .with_service("gone")
            .with_service("b"),
    );
    harness.store.save_chat(chat).await.unwrap();

    let res = harness.send(post("/cSkipGone001", "{}")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(seen(&log), vec![("b".to_string(), Some(-9), None)]);
}

struct FeedResolver;

#[async_trait]
impl TokenHandler for FeedResolver {
    async fn resolve(
        &self,
        _ctx: &DispatchContext,
        request: &WebhookRequest,
    ) -> anyhow::Result<Option<TargetQuery>> {
        if request.body.is_empty() {
            return Ok(None);
        }
        Ok(Some(TargetQuery::Chats(
            Query::new().eq("hooks.services", "feed"),
        )))
    }
}

#[tokio::test]
async fn service_endpoint_uses_token_handler() {
    let log = calls();
    let harness = Harness::new(vec![
        service("feed", Recorder::shared(&log)).with_token_handler(Arc::new(FeedResolver)),
    ]);
    for (id, token) in [(-100, "cFeedChat001"), (-200, "cFeedChat002")] {
        let mut chat = ChatData::new(id);
        chat.hooks.push(Hook::with_token(token).with_service("feed"));
        harness.store.save_chat(chat).await.unwrap();
    }

    let res = harness.send(post("/service/feed", "{\"item\":1}")).await;
    assert_eq!(res.status(), StatusCode::OK);
    let mut chats: Vec<_> = seen(&log).into_iter().map(|(_, chat, _)| chat).collect();
    chats.sort();
    assert_eq!(chats, vec![Some(-200), Some(-100)]);

    let res = harness.send(post("/service/feed", "")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(seen(&log).len(), 2);

    let res = harness.send(post("/service/unknown", "{}")).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn service_endpoint_warns_when_no_target_accepts() {
    let log = calls();
    let harness = Harness::new(vec![
        service(
            "feed",
            Recorder {
                calls: log.clone(),
                fail_chat: Some(-300),
                ..Default::default()
            },
        )
        .with_token_handler(Arc::new(FeedResolver)),
    ]);
    let mut chat = ChatData::new(-300);
    chat.hooks.push(Hook::with_token("cFeedChat003").with_service("feed"));
    harness.store.save_chat(chat).await.unwrap();

    let res = harness.send(post("/service/feed", "{\"item\":2}")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(seen(&log), vec![("feed".to_string(), Some(-300), None)]);
    assert!(logs_contain("webhook handler returned error"));
    assert!(logs_contain("hook not handled"));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn service_endpoint_flood_answers_429() {
    let log = calls();
    let harness = Harness::new(vec![
        service(
            "feed",
            Recorder {
                calls: log.clone(),
                flood_chat: Some(-400),
                ..Default::default()
            },
        )
        .with_token_handler(Arc::new(FeedResolver)),
    ]);
    let mut chat = ChatData::new(-400);
    chat.hooks.push(Hook::with_token("cFeedChat004").with_service("feed"));
    harness.store.save_chat(chat).await.unwrap();

    let res = harness.send(post("/service/feed", "{\"item\":3}")).await;
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(!logs_contain("hook not handled"));
}

#[tokio::test]
async fn head_probe_and_browser_hint() {
    let harness = Harness::new(vec![]);

    let probe = Request::builder()
        .method(Method::HEAD)
        .uri("/cAnyTokenAtAll")
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(probe).await.status(), StatusCode::OK);

    let res = harness.send(get("/uLooksLikeToken")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert!(body_text(res).await.contains("isn't working in a browser"));

    let res = harness.send(get("/favicon.ico")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_text(res).await, "");
}

#[tokio::test]
async fn handler_panic_becomes_500() {
    let harness = Harness::new(vec![service(
        "a",
        Recorder {
            panic: true,
            ..Default::default()
        },
    )]);
    let mut chat = ChatData::new(-5);
    chat.hooks.push(Hook::with_token("cPanicToken1").with_service("a"));
    harness.store.save_chat(chat).await.unwrap();

    let res = harness.send(post("/cPanicToken1", "{}")).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(res).await, "Oops. Something not good.");
}

#[tokio::test]
async fn rate_limit_applies_per_token() {
    let harness = Harness::with_config(vec![], |cfg| {
        cfg.rate_cap = 1;
        cfg.rate_refill_per_sec = 0;
    });
    assert_eq!(
        harness.send(post("/cUnknownRate1", "{}")).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        harness.send(post("/cUnknownRate1", "{}")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        harness.send(post("/cUnknownRate2", "{}")).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn rate_limit_caps_random_tokens_gateway_wide() {
    let harness = Harness::with_config(vec![], |cfg| {
        cfg.rate_global_cap = 2;
        cfg.rate_global_refill_per_sec = 0;
        cfg.rate_max_tracked = 2;
    });
    for token in ["cSpray000001", "cSpray000002"] {
        assert_eq!(
            harness.send(post(&format!("/{token}"), "{}")).await.status(),
            StatusCode::OK
        );
    }
    assert_eq!(
        harness.send(post("/cSpray000003", "{}")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(harness.dumps().len(), 2);
}

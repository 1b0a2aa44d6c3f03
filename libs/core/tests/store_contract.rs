#![cfg(feature = "store_sqlite")]

use std::collections::HashSet;
use std::sync::Arc;

use hookgram_core::{
    Hook, InMemoryStore, Query, SqliteStore, StoreError, SubscriptionStore, TokenScope,
};

fn backends() -> Vec<(&'static str, Arc<dyn SubscriptionStore>)> {
    let memory: Arc<dyn SubscriptionStore> = Arc::new(InMemoryStore::new());
    let sqlite: Arc<dyn SubscriptionStore> =
        Arc::new(SqliteStore::open_in_memory().expect("sqlite store"));
    vec![("memory", memory), ("sqlite", sqlite)]
}

#[tokio::test]
async fn tokens_stay_unique_across_users_and_chats() {
    for (name, store) in backends() {
        store
            .add_user_hook(1, Hook::with_token("uOne"))
            .await
            .unwrap();
        store
            .add_chat_hook(-10, Hook::with_token("cTen"))
            .await
            .unwrap();

        let err = store
            .add_user_hook(2, Hook::with_token("cTen"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateToken(_)), "{name}");
        let err = store
            .add_chat_hook(-20, Hook::with_token("uOne"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateToken(_)), "{name}");
        let err = store
            .add_user_hook(1, Hook::with_token("uOne"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateToken(_)), "{name}");

        let mut tokens = HashSet::new();
        for user in store.find_users(&Query::new()).await.unwrap() {
            for hook in user.hooks {
                assert!(tokens.insert(hook.token), "{name}");
            }
        }
        for chat in store.find_chats(&Query::new()).await.unwrap() {
            for hook in chat.hooks {
                assert!(tokens.insert(hook.token), "{name}");
            }
        }
        assert_eq!(tokens.len(), 2, "{name}");
    }
}

#[tokio::test]
async fn generated_hooks_land_in_their_scope() {
    for (name, store) in backends() {
        let user_hook = Hook::generate(TokenScope::User).with_service("trello");
        let chat_hook = Hook::generate(TokenScope::Chat).with_service("trello");
        store.add_user_hook(5, user_hook.clone()).await.unwrap();
        store.add_chat_hook(-5, chat_hook.clone()).await.unwrap();

        let by_user_token = Query::hook_token(&user_hook.token);
        assert!(store.find_user(&by_user_token).await.unwrap().is_some(), "{name}");
        assert!(store.find_chat(&by_user_token).await.unwrap().is_none(), "{name}");

        let by_chat_token = Query::hook_token(&chat_hook.token);
        assert!(store.find_chat(&by_chat_token).await.unwrap().is_some(), "{name}");
        assert!(store.find_user(&by_chat_token).await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn concurrent_writers_keep_every_hook() {
    for (name, store) in backends() {
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .add_user_hook(9, Hook::with_token(format!("uConcurrent{i}")))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let user = store.get_user(9).await.unwrap().unwrap();
        assert_eq!(user.hooks.len(), 8, "{name}");
    }
}

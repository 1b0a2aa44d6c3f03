//! Persisted subscription documents: users, chats, the hooks they own and the
//! short-lived OAuth correlation records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

pub type ChatId = i64;
pub type UserId = i64;

pub const CORRELATION_KEY_PREFIX: &str = "auth_";

const TOKEN_LEN: usize = 10;
const EPHEMERAL_ID_LEN: usize = 16;
const TOKEN_ALPHABET: &[char] = &[
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
    'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z',
];

/// Random alphanumeric string used for hook tokens, correlation ids and nonces.
pub fn random_id(len: usize) -> String {
    nanoid::nanoid!(len, TOKEN_ALPHABET)
}

/// Which document collection a hook token addresses, decided by its first
/// character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenScope {
    User,
    Chat,
}

impl TokenScope {
    /// `u` addresses users; `c` and the legacy `h` address chats.
    pub fn of(token: &str) -> Option<Self> {
        match token.chars().next() {
            Some('u') => Some(TokenScope::User),
            Some('c') | Some('h') => Some(TokenScope::Chat),
            _ => None,
        }
    }

    pub fn prefix(self) -> char {
        match self {
            TokenScope::User => 'u',
            TokenScope::Chat => 'c',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenScope::User => "user",
            TokenScope::Chat => "chat",
        }
    }
}

/// Subscription binding an opaque URL token to services and target chats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub token: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub chats: Vec<ChatId>,
}

impl Hook {
    /// Creates a hook with a freshly generated token for `scope`.
    pub fn generate(scope: TokenScope) -> Self {
        Self::with_token(format!("{}{}", scope.prefix(), random_id(TOKEN_LEN)))
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            services: Vec::new(),
            chats: Vec::new(),
        }
    }

    /// Appends a service name, keeping the list free of duplicates.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        let service = service.into();
        if !self.services.contains(&service) {
            self.services.push(service);
        }
        self
    }

    /// Appends a target chat, keeping the list free of duplicates.
    pub fn with_chat(mut self, chat_id: ChatId) -> Self {
        if !self.chats.contains(&chat_id) {
            self.chats.push(chat_id);
        }
        self
    }

    pub fn names_service(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }

    pub fn scope(&self) -> Option<TokenScope> {
        TokenScope::of(&self.token)
    }
}

/// Per-service credential bundle kept in `UserData::protected`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectedSettings {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub oauth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_refresh_token: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub oauth_expire_date: Option<OffsetDateTime>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub protected: BTreeMap<String, ProtectedSettings>,
}

impl UserData {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn hook(&self, token: &str) -> Option<&Hook> {
        self.hooks.iter().find(|hook| hook.token == token)
    }

    /// The 1:1 conversation between this user and the bot shares the user's id.
    pub fn private_chat_id(&self) -> ChatId {
        self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatData {
    pub id: ChatId,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

impl ChatData {
    pub fn new(id: ChatId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn hook(&self, token: &str) -> Option<&Hook> {
        self.hooks.iter().find(|hook| hook.token == token)
    }

    pub fn is_group(&self) -> bool {
        is_group_chat(self.id)
    }
}

/// Groups and channels carry negative ids; 1:1 conversations are positive.
pub fn is_group_chat(id: ChatId) -> bool {
    id < 0
}

/// OAuth1 temporary credentials obtained during init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestToken {
    pub token: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationValue {
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_token: Option<RequestToken>,
}

/// Links a browser round trip to the user and service that started it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCorrelation {
    pub key: String,
    pub user_id: UserId,
    pub service: String,
    #[serde(default)]
    pub val: CorrelationValue,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl OAuthCorrelation {
    pub fn new(user_id: UserId, service: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self::with_id(&random_id(EPHEMERAL_ID_LEN), user_id, service, base_url)
    }

    pub fn with_id(
        ephemeral_id: &str,
        user_id: UserId,
        service: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            key: Self::key_for(ephemeral_id),
            user_id,
            service: service.into(),
            val: CorrelationValue {
                base_url: base_url.into(),
                request_token: None,
            },
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn key_for(ephemeral_id: &str) -> String {
        format!("{CORRELATION_KEY_PREFIX}{ephemeral_id}")
    }

    pub fn ephemeral_id(&self) -> &str {
        self.key
            .strip_prefix(CORRELATION_KEY_PREFIX)
            .unwrap_or(&self.key)
    }

    pub fn is_expired(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        self.created_at + ttl < now
    }
}

/// OAuth application registered against a specific service deployment.
///
/// Default providers are derived from a service's static configuration;
/// self-hosted deployments (e.g. a private GitLab) are persisted with their own
/// client credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthProviderRecord {
    pub service: String,
    pub base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

impl OAuthProviderRecord {
    pub fn new(service: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            base_url: base_url.into(),
            client_id: String::new(),
            client_secret: String::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = client_id.into();
        self.client_secret = client_secret.into();
        self
    }

    /// Stable id embedded in callback URLs (`/auth/{internal_id}`).
    pub fn internal_id(&self) -> String {
        hookgram_security::compact_hash(&format!(
            "{}|{}",
            self.service,
            self.base_url.trim_end_matches('/')
        ))
    }
}

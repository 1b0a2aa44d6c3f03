use reqwest::{Client, header};
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use url::Url;

use super::{OAuthError, form_value, parse_form, resolve_endpoint};
use crate::model::OAuthProviderRecord;
use crate::service::{AccessGrant, OAuth2Config};

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenResponse {
    fn from_body(body: &str) -> Self {
        if let Ok(parsed) = serde_json::from_str::<TokenResponse>(body) {
            return parsed;
        }
        let pairs = parse_form(body);
        TokenResponse {
            access_token: form_value(&pairs, "access_token"),
            refresh_token: form_value(&pairs, "refresh_token"),
            expires_in: form_value(&pairs, "expires_in").and_then(|v| v.parse().ok()),
            error: form_value(&pairs, "error"),
            error_description: form_value(&pairs, "error_description"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OAuth2Client {
    http: Client,
    client_id: String,
    client_secret: String,
    auth_url: Url,
    token_url: Url,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl OAuth2Client {
    /// Builds a client for `provider`; its stored credentials take precedence
    /// over the service defaults when present.
    pub fn for_provider(
        http: Client,
        config: &OAuth2Config,
        provider: &OAuthProviderRecord,
        redirect_uri: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        let pick = |own: &str, fallback: &str| {
            if own.is_empty() {
                fallback.to_string()
            } else {
                own.to_string()
            }
        };
        Ok(Self {
            http,
            client_id: pick(&provider.client_id, &config.client_id),
            client_secret: pick(&provider.client_secret, &config.client_secret),
            auth_url: resolve_endpoint(&provider.base_url, &config.auth_url)?,
            token_url: resolve_endpoint(&provider.base_url, &config.token_url)?,
            redirect_uri: redirect_uri.into(),
            scopes: config.scopes.clone(),
        })
    }

    /// Link the user opens to grant access; `state` carries the correlation id.
    pub fn authorize_url(&self, state: &str) -> Url {
        let mut url = self.auth_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri);
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
            query.append_pair("state", state);
        }
        url
    }

    /// Exchanges an authorization code for credentials.
    pub async fn exchange(&self, code: &str) -> Result<AccessGrant, OAuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(self.token_url.clone())
            .header(header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let parsed = TokenResponse::from_body(&body);

        if let Some(error) = parsed.error {
            return Err(OAuthError::Denied(
                parsed.error_description.unwrap_or(error),
            ));
        }
        if !status.is_success() {
            return Err(OAuthError::Provider { status, body });
        }
        let access_token = parsed
            .access_token
            .ok_or(OAuthError::MissingField("access_token"))?;
        Ok(AccessGrant {
            access_token,
            token_secret: None,
            refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
            expires_at: parsed
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| OffsetDateTime::now_utc() + Duration::seconds(secs)),
        })
    }
}

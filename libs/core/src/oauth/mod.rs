//! Provider-side OAuth clients: RFC 5849 (OAuth1, HMAC-SHA1) and the RFC 6749
//! authorization-code grant.

mod oauth1;
mod oauth2;

pub use oauth1::OAuth1Client;
pub use oauth2::OAuth2Client;

use reqwest::StatusCode;
use url::Url;

use crate::model::OAuthProviderRecord;

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("invalid provider url {0}")]
    InvalidUrl(String),
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider answered {status}: {body}")]
    Provider { status: StatusCode, body: String },
    #[error("provider response is missing {0}")]
    MissingField(&'static str),
    #[error("{0}")]
    Denied(String),
}

/// Resolves an endpoint that may be absolute or relative to the provider's
/// base URL.
pub fn resolve_endpoint(base_url: &str, endpoint: &str) -> Result<Url, OAuthError> {
    if let Ok(url) = Url::parse(endpoint) {
        return Ok(url);
    }
    let base = Url::parse(base_url).map_err(|_| OAuthError::InvalidUrl(base_url.to_string()))?;
    let base = if base.path().ends_with('/') {
        base
    } else {
        let path = format!("{}/", base.path());
        let mut base = base;
        base.set_path(&path);
        base
    };
    base.join(endpoint.trim_start_matches('/'))
        .map_err(|_| OAuthError::InvalidUrl(endpoint.to_string()))
}

/// Callback URL registered with the provider: `{public}/auth/{internal_id}`.
pub fn callback_url(public_base_url: &str, provider: &OAuthProviderRecord) -> String {
    format!(
        "{}/auth/{}",
        public_base_url.trim_end_matches('/'),
        provider.internal_id()
    )
}

/// Parses `a=1&b=2` bodies returned by OAuth1 and some OAuth2 providers.
pub(crate) fn parse_form(body: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect()
}

pub(crate) fn form_value(pairs: &[(String, String)], key: &str) -> Option<String> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .filter(|v| !v.is_empty())
}

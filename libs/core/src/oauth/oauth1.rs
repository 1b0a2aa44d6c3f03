use hookgram_security::oauth1::{
    SIGNATURE_METHOD, authorization_header, hmac_sha1_signature, signature_base_string,
};
use reqwest::{Client, header};
use time::OffsetDateTime;
use url::Url;

use super::{OAuthError, form_value, parse_form, resolve_endpoint};
use crate::model::{OAuthProviderRecord, RequestToken, random_id};
use crate::service::{AccessGrant, OAuth1Config};

const NONCE_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct OAuth1Client {
    http: Client,
    consumer_key: String,
    consumer_secret: String,
    request_token_url: Url,
    authorize_url: Url,
    access_token_url: Url,
}

impl OAuth1Client {
    pub fn for_provider(
        http: Client,
        config: &OAuth1Config,
        provider: &OAuthProviderRecord,
    ) -> Result<Self, OAuthError> {
        let consumer_key = if provider.client_id.is_empty() {
            config.consumer_key.clone()
        } else {
            provider.client_id.clone()
        };
        let consumer_secret = if provider.client_secret.is_empty() {
            config.consumer_secret.clone()
        } else {
            provider.client_secret.clone()
        };
        Ok(Self {
            http,
            consumer_key,
            consumer_secret,
            request_token_url: resolve_endpoint(&provider.base_url, &config.request_token_url)?,
            authorize_url: resolve_endpoint(&provider.base_url, &config.authorize_url)?,
            access_token_url: resolve_endpoint(&provider.base_url, &config.access_token_url)?,
        })
    }

    /// Obtains temporary credentials and the URL the user must visit to
    /// authorize them.
    pub async fn request_token(&self, callback: &str) -> Result<(RequestToken, Url), OAuthError> {
        let pairs = self
            .signed_post(
                &self.request_token_url,
                vec![("oauth_callback".into(), callback.into())],
                "",
            )
            .await?;
        let token = RequestToken {
            token: form_value(&pairs, "oauth_token").ok_or(OAuthError::MissingField("oauth_token"))?,
            secret: form_value(&pairs, "oauth_token_secret").unwrap_or_default(),
        };
        let mut authorize = self.authorize_url.clone();
        authorize
            .query_pairs_mut()
            .append_pair("oauth_token", &token.token);
        Ok((token, authorize))
    }

    /// Trades the verifier returned to the callback for token credentials.
    pub async fn access_token(
        &self,
        request_token: &RequestToken,
        verifier: &str,
    ) -> Result<AccessGrant, OAuthError> {
        let pairs = self
            .signed_post(
                &self.access_token_url,
                vec![
                    ("oauth_token".into(), request_token.token.clone()),
                    ("oauth_verifier".into(), verifier.into()),
                ],
                &request_token.secret,
            )
            .await?;
        Ok(AccessGrant {
            access_token: form_value(&pairs, "oauth_token").unwrap_or_default(),
            token_secret: form_value(&pairs, "oauth_token_secret"),
            refresh_token: None,
            expires_at: None,
        })
    }

    async fn signed_post(
        &self,
        url: &Url,
        extra: Vec<(String, String)>,
        token_secret: &str,
    ) -> Result<Vec<(String, String)>, OAuthError> {
        let header_value = self.authorization(
            url,
            extra,
            token_secret,
            &random_id(NONCE_LEN),
            OffsetDateTime::now_utc().unix_timestamp(),
        );
        let response = self
            .http
            .post(url.clone())
            .header(header::AUTHORIZATION, header_value)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(OAuthError::Provider { status, body });
        }
        Ok(parse_form(&body))
    }

    /// Signs a POST to `url`; query parameters of `url` take part in the
    /// signature.
    fn authorization(
        &self,
        url: &Url,
        extra: Vec<(String, String)>,
        token_secret: &str,
        nonce: &str,
        timestamp: i64,
    ) -> String {
        let mut oauth_params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.consumer_key.clone()),
            ("oauth_nonce".into(), nonce.into()),
            ("oauth_signature_method".into(), SIGNATURE_METHOD.into()),
            ("oauth_timestamp".into(), timestamp.to_string()),
            ("oauth_version".into(), "1.0".into()),
        ];
        oauth_params.extend(extra);

        let mut signed = oauth_params.clone();
        signed.extend(url.query_pairs().into_owned());
        let mut bare = url.clone();
        bare.set_query(None);
        bare.set_fragment(None);

        let base = signature_base_string("POST", bare.as_str(), &signed);
        let signature = hmac_sha1_signature(&base, &self.consumer_secret, token_secret);
        oauth_params.push(("oauth_signature".into(), signature));
        authorization_header(&oauth_params)
    }
}

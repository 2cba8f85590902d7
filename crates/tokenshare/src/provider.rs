//! Calls to the identity provider issuing and refreshing token pairs.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    config::ClientCredentials,
    error::{Error, Result},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One successful provider response. Consumed right away to fill the store.
#[derive(Clone, PartialEq, Eq, veil::Redact)]
pub struct TokenRecord {
    #[redact]
    pub access_token: String,
    #[redact]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds.
    pub access_token_expires_in: u64,
    /// Lifetime of the refresh token in seconds, if the provider reported one.
    pub refresh_token_expires_in: Option<u64>,
}

/// Source of token pairs.
///
/// A single call performs a single attempt: retries are the caller's business.
#[async_trait]
pub trait TokenProvider: std::fmt::Debug + Send + Sync {
    /// Obtain a fresh pair using only the client credentials.
    async fn create_tokens(&self, credentials: &ClientCredentials) -> Result<TokenRecord>;

    /// Exchange `refresh_token` for a fresh pair.
    async fn refresh_tokens(
        &self,
        refresh_token: &str,
        credentials: &ClientCredentials,
    ) -> Result<TokenRecord>;
}

/// [`TokenProvider`] talking to the provider's HTTP endpoints.
///
/// Uses its own `reqwest::Client` so that token calls never pass through the
/// [`AuthInterceptor`](crate::AuthInterceptor).
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    http_client: reqwest::Client,
    create_token_url: Url,
    refresh_token_url: Url,
}

impl HttpTokenProvider {
    /// Create a provider with a dedicated client: redirects disabled, 10s connect timeout
    /// and 30s request timeout.
    ///
    /// # Errors
    /// Fails if the TLS backend cannot be initialized.
    pub fn new(create_token_url: Url, refresh_token_url: Url) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(Arc::new)?;
        Ok(Self::new_with_client(
            http_client,
            create_token_url,
            refresh_token_url,
        ))
    }

    /// Use a custom `reqwest::Client` for token requests.
    /// Make sure its `redirect` policy is `Policy::none()` to prevent SSRF vulnerabilities.
    #[must_use]
    pub fn new_with_client(
        http_client: reqwest::Client,
        create_token_url: Url,
        refresh_token_url: Url,
    ) -> Self {
        Self {
            http_client,
            create_token_url,
            refresh_token_url,
        }
    }

    async fn parse(response: reqwest::Response) -> Result<TokenRecord> {
        let status = response.status();
        if !status.is_success() {
            return Err(Error::provider(format!("HTTP status {status}")));
        }
        let envelope: TokenEnvelope = response
            .json()
            .await
            .map_err(|e| Error::provider(format!("Unexpected response body: {e}")))?;
        envelope.into_record()
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn create_tokens(&self, credentials: &ClientCredentials) -> Result<TokenRecord> {
        tracing::debug!(
            "Requesting new tokens for client `{}`",
            credentials.client_id
        );
        let response = self
            .http_client
            .post(self.create_token_url.clone())
            .json(&CreateTokenRequest {
                client_id: &credentials.client_id,
                client_secret: &credentials.client_secret,
            })
            .send()
            .await
            .map_err(|e| Error::provider(format!("Create token request failed: {e}")))?;
        Self::parse(response).await
    }

    async fn refresh_tokens(
        &self,
        refresh_token: &str,
        credentials: &ClientCredentials,
    ) -> Result<TokenRecord> {
        tracing::debug!(
            "Exchanging refresh token for client `{}`",
            credentials.client_id
        );
        let response = self
            .http_client
            .post(self.refresh_token_url.clone())
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::provider(format!("Refresh token request failed: {e}")))?;
        Self::parse(response).await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Deserialize)]
struct TokenEnvelope {
    status: Option<u16>,
    message: Option<String>,
    data: Option<TokenData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    access_token: Option<String>,
    refresh_token: Option<String>,
    access_token_expires_in: Option<u64>,
    refresh_token_expires_in: Option<u64>,
}

impl TokenEnvelope {
    fn into_record(self) -> Result<TokenRecord> {
        if self.status != Some(200) {
            return Err(Error::provider(format!(
                "Provider reported status {}: {}",
                self.status
                    .map_or_else(|| "none".to_string(), |s| s.to_string()),
                self.message.as_deref().unwrap_or("no message")
            )));
        }
        let data = self
            .data
            .ok_or_else(|| Error::provider("Response contains no token data"))?;
        let access_token = data
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::provider("Response contains no access token"))?;
        let access_token_expires_in = data
            .access_token_expires_in
            .ok_or_else(|| Error::provider("Response contains no access token lifetime"))?;

        Ok(TokenRecord {
            access_token,
            refresh_token: data.refresh_token.filter(|t| !t.is_empty()),
            access_token_expires_in,
            refresh_token_expires_in: data.refresh_token_expires_in,
        })
    }
}

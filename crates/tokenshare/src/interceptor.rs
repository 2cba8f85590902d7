use std::future::Future;

use http::{header::AUTHORIZATION, HeaderValue, StatusCode};

use crate::{
    error::{Error, Result},
    manager::TokenManager,
};

/// Attaches the shared access token to outbound requests and recovers from `401`s.
///
/// A request answered with `401 Unauthorized` is retried exactly once: the tokens are
/// force-refreshed first, and the retry carries the new token. If that refresh fails, the
/// retry is sent with the previous token anyway and its response is returned as-is.
///
/// Requests to the token endpoints themselves (URLs containing one of the bypass
/// patterns) pass through untouched.
#[derive(Debug, Clone)]
pub struct AuthInterceptor {
    manager: TokenManager,
    bypass_patterns: Vec<String>,
}

impl AuthInterceptor {
    /// Create an interceptor using the bypass patterns configured for `manager`.
    #[must_use]
    pub fn new(manager: TokenManager) -> Self {
        let bypass_patterns = manager.bypass_patterns().to_vec();
        Self {
            manager,
            bypass_patterns,
        }
    }

    #[must_use]
    pub fn set_bypass_patterns(mut self, patterns: Vec<String>) -> Self {
        self.bypass_patterns = patterns;
        self
    }

    #[must_use]
    pub fn manager(&self) -> &TokenManager {
        &self.manager
    }

    /// Whether requests to `url` are sent without a token.
    #[must_use]
    pub fn bypasses(&self, url: &url::Url) -> bool {
        let url = url.as_str();
        self.bypass_patterns
            .iter()
            .any(|pattern| url.contains(pattern.as_str()))
    }

    /// The `Bearer` authorization header for the current access token.
    ///
    /// # Errors
    /// - Errors of [`TokenManager::access_token`].
    /// - [`Error::InvalidHeaderValue`] if the token is not a valid header value.
    pub async fn authorization_header(&self) -> Result<HeaderValue> {
        let token = self.manager.access_token().await?;
        bearer_header(&token)
    }

    /// Send `request` through `call` with the access token attached.
    ///
    /// # Errors
    /// - Errors of [`AuthInterceptor::authorization_header`] for the first attempt.
    /// - Whatever `call` fails with.
    pub async fn intercept<F, Fut>(
        &self,
        mut request: reqwest::Request,
        mut call: F,
    ) -> Result<reqwest::Response>
    where
        F: FnMut(reqwest::Request) -> Fut,
        Fut: Future<Output = Result<reqwest::Response>>,
    {
        if self.bypasses(request.url()) {
            return call(request).await;
        }

        let header = self.authorization_header().await?;
        request.headers_mut().insert(AUTHORIZATION, header);
        let retry = request.try_clone();
        let url = request.url().clone();

        let response = call(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut retry) = retry else {
            tracing::warn!("Received 401 from `{url}`, but the request body cannot be replayed");
            return Ok(response);
        };
        drop(response);
        tracing::warn!("Received 401 from `{url}`. Refreshing tokens and retrying once.");

        match self.refreshed_header().await {
            Ok(header) => {
                retry.headers_mut().insert(AUTHORIZATION, header);
            }
            Err(e) => {
                tracing::warn!("Token refresh after 401 failed: {e}. Retrying with previous token.");
            }
        }
        call(retry).await
    }

    async fn refreshed_header(&self) -> Result<HeaderValue> {
        self.manager.refresh_tokens().await?;
        self.authorization_header().await
    }
}

fn bearer_header(token: &str) -> Result<HeaderValue> {
    let mut header =
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| Error::InvalidHeaderValue)?;
    header.set_sensitive(true);
    Ok(header)
}

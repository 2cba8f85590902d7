//! Shared token lifecycle: read-through lookup and lock-guarded refresh.
use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ClientCredentials, LockConfig, TokenConfig},
    error::{Error, Result},
    provider::{HttpTokenProvider, TokenProvider, TokenRecord},
    retry::{self, RetryPolicy},
    store::TokenStore,
};

const MIN_TTL_SECS: u64 = 1;
/// Upper bound for any stored TTL, whatever lifetime the provider reports.
const MAX_TTL_SECS: u64 = 365 * 86_400;
/// Assumed refresh token lifetime when the provider does not report one.
const DEFAULT_REFRESH_TOKEN_LIFETIME_SECS: u64 = 7 * 86_400;

/// What the shared store currently says about the access token.
#[derive(Clone, PartialEq, Eq, veil::Redact)]
pub enum TokenState {
    /// No access token and no refresh in flight.
    NoToken,
    /// A cached access token that has not reached its TTL.
    Valid(#[redact] String),
    /// No access token, but some instance holds the refresh lock.
    Refreshing,
}

/// Diagnostic snapshot of the shared store. Never contains token values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenStatus {
    /// Whether an access token is cached.
    pub access_token_present: bool,
    /// Length of the cached access token, `0` if there is none.
    pub access_token_length: usize,
    /// Remaining lifetime of the access token entry.
    pub access_token_ttl_secs: Option<u64>,
    /// Whether a refresh token is cached.
    pub refresh_token_present: bool,
    /// Remaining lifetime of the refresh token entry.
    pub refresh_token_ttl_secs: Option<u64>,
    /// Whether some instance holds the refresh lock.
    pub lock_held: bool,
    /// Remaining lifetime of the refresh lock.
    pub lock_ttl_secs: Option<u64>,
}

/// Keeps one access/refresh token pair valid for all instances sharing a [`TokenStore`].
///
/// The store is the only state: [`TokenManager::access_token`] returns the cached access
/// token while its TTL runs, and otherwise performs a refresh. Refreshes are serialized
/// across instances by a lock entry in the store. The instance holding the lock exchanges
/// the refresh token, falling back to the client credentials if that fails. Other
/// instances poll the store until the holder has published a new token.
///
/// Uses `Arc` internally for cheap cloning.
#[derive(Debug, Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn TokenStore>,
    provider: Arc<dyn TokenProvider>,
    credentials: ClientCredentials,
    access_token_key: String,
    refresh_token_key: String,
    lock_key: String,
    access_token_buffer: Duration,
    refresh_token_buffer: Duration,
    retry_policy: RetryPolicy,
    locking: LockConfig,
    bypass_patterns: Vec<String>,
    cancel: CancellationToken,
}

impl TokenManager {
    /// Create a new [`TokenManagerBuilder`].
    #[must_use]
    pub fn builder(config: TokenConfig, store: impl TokenStore + 'static) -> TokenManagerBuilder {
        TokenManagerBuilder::new(config, Arc::new(store))
    }

    /// Return a valid access token, refreshing it first if the store holds none.
    ///
    /// # Errors
    /// - Errors of [`TokenManager::refresh_tokens`].
    /// - [`Error::TokenUnavailable`] if the store still has no token after the refresh.
    /// - [`Error::Store`] if the store cannot be read.
    pub async fn access_token(&self) -> Result<String> {
        let inner = &self.inner;
        if let Some(token) = inner.store.get(&inner.access_token_key).await? {
            return Ok(token);
        }

        tracing::debug!("No access token in store. Refreshing tokens.");
        self.refresh_tokens().await?;

        inner
            .store
            .get(&inner.access_token_key)
            .await?
            .ok_or_else(|| {
                tracing::error!("Access token missing from store right after refresh");
                Error::TokenUnavailable
            })
    }

    /// Refresh the shared token pair, or wait for the instance that is already doing so.
    ///
    /// Runs a refresh even if a valid access token is cached, which makes this the
    /// force-refresh trigger as well.
    ///
    /// # Errors
    /// - [`Error::TokenRefreshFailed`] if both the exchange and new credentials failed.
    /// - [`Error::TokenRefreshTimeout`] if another instance held the lock and no token
    ///   appeared within the wait timeout.
    /// - [`Error::Cancelled`] if the manager's cancellation token fired.
    /// - [`Error::Store`] if the store cannot be reached.
    pub async fn refresh_tokens(&self) -> Result<()> {
        let inner = &self.inner;
        let holder = lock_holder();

        let acquired = inner
            .store
            .try_acquire_lock(&inner.lock_key, &holder, inner.locking.lock_timeout())
            .await?;
        if !acquired {
            tracing::debug!("Another instance is refreshing tokens. Waiting for it to finish.");
            return self.wait_for_token().await;
        }

        tracing::debug!("Acquired refresh lock `{}`", inner.lock_key);
        let guard = LockGuard::new(inner.store.clone(), &inner.lock_key, holder);
        let result = self.refresh_while_locked().await;
        guard.release().await;
        result
    }

    /// Derive the current [`TokenState`] from the store.
    ///
    /// # Errors
    /// Returns [`Error::Store`] if the store cannot be read.
    pub async fn state(&self) -> Result<TokenState> {
        let inner = &self.inner;
        if let Some(token) = inner.store.get(&inner.access_token_key).await? {
            return Ok(TokenState::Valid(token));
        }
        if inner.store.get(&inner.lock_key).await?.is_some() {
            Ok(TokenState::Refreshing)
        } else {
            Ok(TokenState::NoToken)
        }
    }

    /// Snapshot of the shared store. Never triggers a refresh.
    ///
    /// # Errors
    /// Returns [`Error::Store`] if the store cannot be read.
    pub async fn status(&self) -> Result<TokenStatus> {
        let inner = &self.inner;
        let store = &inner.store;
        let access_token = store.get(&inner.access_token_key).await?;
        let refresh_token = store.get(&inner.refresh_token_key).await?;
        let lock = store.get(&inner.lock_key).await?;
        let ttl_secs = |ttl: Option<Duration>| ttl.map(|t| t.as_secs());

        Ok(TokenStatus {
            access_token_present: access_token.is_some(),
            access_token_length: access_token.as_ref().map_or(0, String::len),
            access_token_ttl_secs: ttl_secs(store.ttl(&inner.access_token_key).await?),
            refresh_token_present: refresh_token.is_some(),
            refresh_token_ttl_secs: ttl_secs(store.ttl(&inner.refresh_token_key).await?),
            lock_held: lock.is_some(),
            lock_ttl_secs: ttl_secs(store.ttl(&inner.lock_key).await?),
        })
    }

    /// Make sure the store holds an access token, refreshing once if it does not.
    ///
    /// Called by [`TokenManagerBuilder::build`] unless disabled.
    ///
    /// # Errors
    /// Returns [`Error::Initialization`] wrapping the cause.
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        let result = async {
            if inner.store.get(&inner.access_token_key).await?.is_some() {
                tracing::debug!("Access token already present in store. Skipping initial fetch.");
                return Ok(());
            }
            tracing::info!(
                "Fetching initial tokens for client `{}`",
                inner.credentials.client_id
            );
            self.refresh_tokens().await
        }
        .await;

        result.map_err(|e| {
            tracing::error!("Failed to initialize tokens: {e}");
            Error::Initialization(Box::new(e))
        })
    }

    pub(crate) fn bypass_patterns(&self) -> &[String] {
        &self.inner.bypass_patterns
    }

    async fn refresh_while_locked(&self) -> Result<()> {
        let inner = &self.inner;
        let record = match inner.store.get(&inner.refresh_token_key).await? {
            Some(refresh_token) => match self.refresh_access_token(&refresh_token).await {
                Ok(record) => record,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        "Refresh token exchange failed: {e}. Requesting new tokens instead."
                    );
                    self.request_new_tokens().await?
                }
            },
            None => {
                tracing::debug!("No refresh token in store. Requesting new tokens.");
                self.request_new_tokens().await?
            }
        };
        self.store_tokens(&record).await
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenRecord> {
        let provider = &self.inner.provider;
        let credentials = &self.inner.credentials;
        retry::execute(
            &self.inner.retry_policy,
            "refresh-access-token",
            &self.inner.cancel,
            move || provider.refresh_tokens(refresh_token, credentials),
        )
        .await
    }

    async fn request_new_tokens(&self) -> Result<TokenRecord> {
        let provider = &self.inner.provider;
        let credentials = &self.inner.credentials;
        retry::execute(
            &self.inner.retry_policy,
            "request-new-tokens",
            &self.inner.cancel,
            move || provider.create_tokens(credentials),
        )
        .await
        .map_err(|e| match e {
            Error::Cancelled => e,
            e => {
                tracing::error!("Failed to obtain new tokens: {e}");
                Error::TokenRefreshFailed(Box::new(e))
            }
        })
    }

    async fn store_tokens(&self, record: &TokenRecord) -> Result<()> {
        let inner = &self.inner;
        let access_ttl = access_token_ttl(record.access_token_expires_in, inner.access_token_buffer);
        inner
            .store
            .set_with_ttl(&inner.access_token_key, &record.access_token, access_ttl)
            .await?;

        if let Some(refresh_token) = &record.refresh_token {
            let refresh_ttl =
                refresh_token_ttl(record.refresh_token_expires_in, inner.refresh_token_buffer);
            inner
                .store
                .set_with_ttl(&inner.refresh_token_key, refresh_token, refresh_ttl)
                .await?;
        }

        tracing::info!(
            "Stored new tokens for client `{}`. Access token expires in {}s.",
            inner.credentials.client_id,
            access_ttl.as_secs()
        );
        Ok(())
    }

    async fn wait_for_token(&self) -> Result<()> {
        let inner = &self.inner;
        let wait_timeout = inner.locking.wait_timeout();
        let deadline = Instant::now() + wait_timeout;

        loop {
            if inner.store.get(&inner.access_token_key).await?.is_some() {
                tracing::debug!("Token refreshed by another instance");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    "No token appeared within {}ms while another instance held the refresh lock",
                    wait_timeout.as_millis()
                );
                return Err(Error::TokenRefreshTimeout(wait_timeout));
            }

            let pause = inner.locking.poll_interval().min(deadline - now);
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = inner.cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

/// Builder for [`TokenManager`].
///
/// The following configurations are available:
/// * `provider`: Custom [`TokenProvider`]. Default is an [`HttpTokenProvider`] for the
///   configured URLs.
/// * `http_client`: Custom `reqwest::Client` for the default provider.
/// * `cancellation_token`: Cancels backoff sleeps and lock waits. Default is a token that
///   never fires.
/// * `initialize`: Fetch tokens in [`TokenManagerBuilder::build`] if the store has none.
///   Default is `true`.
#[derive(Debug)]
pub struct TokenManagerBuilder {
    config: TokenConfig,
    store: Arc<dyn TokenStore>,
    provider: Option<Arc<dyn TokenProvider>>,
    http_client: Option<reqwest::Client>,
    cancel: Option<CancellationToken>,
    initialize: bool,
}

impl TokenManagerBuilder {
    #[must_use]
    pub fn new(config: TokenConfig, store: Arc<dyn TokenStore>) -> Self {
        Self {
            config,
            store,
            provider: None,
            http_client: None,
            cancel: None,
            initialize: true,
        }
    }

    #[must_use]
    pub fn set_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Optionally specify the `reqwest::Client` used by the default provider.
    /// When setting a custom client, please make sure to set the `redirect` policy to
    /// `Policy::none()` to prevent SSRF vulnerabilities.
    #[must_use]
    pub fn set_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    #[must_use]
    pub fn set_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Do not fetch tokens on [`TokenManagerBuilder::build`].
    #[must_use]
    pub fn skip_initialization(mut self) -> Self {
        self.initialize = false;
        self
    }

    /// Build the [`TokenManager`].
    /// Unless [`Self::skip_initialization`] was called, this fetches tokens if the store
    /// has no access token yet.
    ///
    /// # Errors
    /// - [`Error::InvalidConfig`] if the configuration does not validate.
    /// - [`Error::Initialization`] if the initial fetch fails.
    pub async fn build(self) -> Result<TokenManager> {
        let config = self.config;
        config.validate()?;

        let provider: Arc<dyn TokenProvider> = match (self.provider, self.http_client) {
            (Some(provider), _) => provider,
            (None, Some(client)) => Arc::new(HttpTokenProvider::new_with_client(
                client,
                config.create_token_url.clone(),
                config.refresh_token_url.clone(),
            )),
            (None, None) => Arc::new(HttpTokenProvider::new(
                config.create_token_url.clone(),
                config.refresh_token_url.clone(),
            )?),
        };

        let inner = Inner {
            store: self.store,
            provider,
            access_token_key: config.keys.access_token(),
            refresh_token_key: config.keys.refresh_token(),
            lock_key: config.keys.lock(),
            access_token_buffer: Duration::from_secs(
                config.access_token_buffer_minutes.saturating_mul(60),
            ),
            refresh_token_buffer: Duration::from_secs(
                config.refresh_token_buffer_days.saturating_mul(86_400),
            ),
            retry_policy: config.retry.policy(),
            locking: config.locking,
            bypass_patterns: config.bypass_patterns,
            credentials: config.credentials,
            cancel: self.cancel.unwrap_or_default(),
        };

        let manager = TokenManager {
            inner: Arc::new(inner),
        };
        if self.initialize {
            manager.initialize().await?;
        }
        Ok(manager)
    }
}

/// Holds the refresh lock. Release it with [`LockGuard::release`]; if the guard is dropped
/// instead (the refresh future was cancelled), the lock is released in a spawned task, or
/// left to expire if no runtime is available.
#[derive(Debug)]
struct LockGuard {
    store: Arc<dyn TokenStore>,
    lock_key: String,
    holder: Option<String>,
}

impl LockGuard {
    fn new(store: Arc<dyn TokenStore>, lock_key: &str, holder: String) -> Self {
        Self {
            store,
            lock_key: lock_key.to_string(),
            holder: Some(holder),
        }
    }

    async fn release(mut self) {
        if let Some(holder) = self.holder.take() {
            release_lock(self.store.as_ref(), &self.lock_key, &holder).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(holder) = self.holder.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let lock_key = std::mem::take(&mut self.lock_key);
            handle.spawn(async move {
                release_lock(store.as_ref(), &lock_key, &holder).await;
            });
        }
    }
}

async fn release_lock(store: &dyn TokenStore, lock_key: &str, holder: &str) {
    match store.release_lock(lock_key, holder).await {
        Ok(true) => tracing::debug!("Released refresh lock `{lock_key}`"),
        Ok(false) => tracing::warn!(
            "Refresh lock `{lock_key}` expired or was taken over before it could be released"
        ),
        Err(e) => tracing::warn!("Failed to release refresh lock `{lock_key}`: {e}"),
    }
}

fn lock_holder() -> String {
    format!("{}-{:016x}", std::process::id(), rand::random::<u64>())
}

fn access_token_ttl(expires_in_secs: u64, buffer: Duration) -> Duration {
    bounded_ttl(expires_in_secs, buffer)
}

fn refresh_token_ttl(expires_in_secs: Option<u64>, buffer: Duration) -> Duration {
    bounded_ttl(
        expires_in_secs.unwrap_or(DEFAULT_REFRESH_TOKEN_LIFETIME_SECS),
        buffer,
    )
}

fn bounded_ttl(lifetime_secs: u64, buffer: Duration) -> Duration {
    Duration::from_secs(
        lifetime_secs
            .saturating_sub(buffer.as_secs())
            .clamp(MIN_TTL_SECS, MAX_TTL_SECS),
    )
}

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    config::{ClientCredentials, TokenConfig},
    error::{Error, Result},
    manager::TokenManager,
    provider::{TokenProvider, TokenRecord},
    store::MemoryTokenStore,
};

/// Provider answering from queued responses, counting calls.
/// An empty queue answers with a provider error.
#[derive(Debug, Default)]
pub(crate) struct ScriptedProvider {
    create: Mutex<VecDeque<Result<TokenRecord>>>,
    refresh: Mutex<VecDeque<Result<TokenRecord>>>,
    create_calls: AtomicU32,
    refresh_calls: AtomicU32,
    delay: Duration,
}

impl ScriptedProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every call takes `delay` before answering.
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn push_create(&self, response: Result<TokenRecord>) -> &Self {
        self.create
            .lock()
            .expect("Non-poisoned lock")
            .push_back(response);
        self
    }

    pub(crate) fn push_refresh(&self, response: Result<TokenRecord>) -> &Self {
        self.refresh
            .lock()
            .expect("Non-poisoned lock")
            .push_back(response);
        self
    }

    pub(crate) fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    async fn answer(&self, queue: &Mutex<VecDeque<Result<TokenRecord>>>) -> Result<TokenRecord> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = queue.lock().expect("Non-poisoned lock").pop_front();
        next.unwrap_or_else(|| Err(Error::provider("no scripted response")))
    }
}

#[async_trait]
impl TokenProvider for ScriptedProvider {
    async fn create_tokens(&self, _credentials: &ClientCredentials) -> Result<TokenRecord> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.create).await
    }

    async fn refresh_tokens(
        &self,
        _refresh_token: &str,
        _credentials: &ClientCredentials,
    ) -> Result<TokenRecord> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.refresh).await
    }
}

/// A pair with a 600s access token and no reported refresh lifetime.
pub(crate) fn record(access_token: &str, refresh_token: &str) -> TokenRecord {
    TokenRecord {
        access_token: access_token.to_string(),
        refresh_token: Some(refresh_token.to_string()),
        access_token_expires_in: 600,
        refresh_token_expires_in: None,
    }
}

pub(crate) fn unavailable() -> Result<TokenRecord> {
    Err(Error::provider("HTTP status 503 Service Unavailable"))
}

/// Configuration with short backoffs and provider URLs under `base_url`.
pub(crate) fn config(base_url: &str) -> TokenConfig {
    TokenConfig::builder()
        .credentials(ClientCredentials::new("my-client", "my-secret"))
        .create_token_url(
            format!("{base_url}/v1/token/create")
                .parse()
                .expect("valid url"),
        )
        .refresh_token_url(
            format!("{base_url}/v1/token/refresh")
                .parse()
                .expect("valid url"),
        )
        .retry(
            crate::config::RetryConfig::builder()
                .backoff_delay_ms(100)
                .max_backoff_delay_ms(1000)
                .build(),
        )
        .build()
}

/// Manager over `store` and `provider` that skips the initial fetch.
pub(crate) async fn manager(
    store: &MemoryTokenStore,
    provider: &Arc<ScriptedProvider>,
) -> TokenManager {
    TokenManager::builder(config("http://localhost"), store.clone())
        .set_provider(provider.clone())
        .skip_initialization()
        .build()
        .await
        .expect("valid configuration")
}

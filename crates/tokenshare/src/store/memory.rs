use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use super::TokenStore;
use crate::error::Result;

/// Stand-in expiry for TTLs too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86_400);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn new(value: &str, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value: value.to_string(),
            expires_at: now
                .checked_add(ttl)
                .unwrap_or_else(|| now + FAR_FUTURE),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`TokenStore`].
///
/// Clones share the same map, so several [`TokenManager`](crate::TokenManager)s built on
/// clones of one store behave like instances sharing one cache. Nothing is shared across
/// processes: use it for tests and single-instance deployments only.
///
/// Expiry follows [`tokio::time::Instant`], so paused test runtimes control it.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        // Unwrap Mutex to propagate poison (writer panicked)
        let mut entries = self.entries.lock().expect("Non-poisoned lock");
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries)
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_live_entries(|entries| entries.get(key).map(|e| e.value.clone())))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.with_live_entries(|entries| {
            entries.insert(key.to_string(), Entry::new(value, ttl));
        });
        Ok(())
    }

    async fn try_acquire_lock(&self, lock_key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        Ok(self.with_live_entries(|entries| {
            if entries.contains_key(lock_key) {
                return false;
            }
            entries.insert(lock_key.to_string(), Entry::new(holder, ttl));
            true
        }))
    }

    async fn release_lock(&self, lock_key: &str, holder: &str) -> Result<bool> {
        Ok(self.with_live_entries(|entries| {
            if entries.get(lock_key).is_some_and(|e| e.value == holder) {
                entries.remove(lock_key);
                true
            } else {
                false
            }
        }))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.with_live_entries(|entries| {
            entries
                .get(key)
                .map(|e| e.expires_at.saturating_duration_since(Instant::now()))
        }))
    }
}

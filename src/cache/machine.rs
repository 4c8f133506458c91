//! Cache machine: hashed get/set/invalidate over a [`CacheBackend`].
//!
//! Every entry is stored together with its logical expiry. The logical expiry
//! drives stampede mitigation; the backend TTL is an independent backstop.
//! Backend failures never reach the caller: reads degrade to a miss and
//! writes are dropped.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use super::backend::CacheBackend;
use super::config::CacheConfig;
use super::keys::{CacheKey, hash_key};

const METRIC_HIT: &str = "herdcache_hit_total";
const METRIC_MISS: &str = "herdcache_miss_total";
const METRIC_MITIGATION: &str = "herdcache_mitigation_total";
const METRIC_BACKEND_ERROR: &str = "herdcache_backend_error_total";
const METRIC_INVALIDATE: &str = "herdcache_invalidate_total";

/// Stored pairing of a value and its logical expiry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    #[serde(with = "time::serde::timestamp")]
    expires_at: OffsetDateTime,
}

pub struct CacheMachine {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl CacheMachine {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Backend key for `key`.
    pub fn hash(&self, key: &CacheKey) -> String {
        hash_key(&self.config.key_prefix, key.as_str())
    }

    /// Store `value` with a logical expiry of now plus the configured lifetime.
    ///
    /// `ttl` overrides the backend TTL. Empty keys and values serializing to
    /// `null` are ignored.
    pub fn set<V: Serialize + ?Sized>(&self, key: &CacheKey, value: &V, ttl: Option<Duration>) {
        let Some(expires_at) = OffsetDateTime::now_utc().checked_add(self.config.expiration())
        else {
            warn!(
                key = %key,
                expiration_hours = self.config.expiration_hours,
                "Skipping cache write: logical expiry out of range"
            );
            return;
        };
        self.set_until(key, value, ttl, expires_at);
    }

    /// Store `value` with an explicit logical expiry.
    pub fn set_until<V: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &V,
        ttl: Option<Duration>,
        expires_at: OffsetDateTime,
    ) {
        if key.is_empty() {
            return;
        }
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %key, error = %err, "Skipping cache write for unserializable value");
                return;
            }
        };
        if value.is_null() {
            return;
        }
        self.write_entry(key, StoredEntry { value, expires_at }, ttl);
    }

    /// Look up `key`.
    ///
    /// When `mitigation` is given and the entry is within the mitigation
    /// window of its logical expiry, the entry is first re-written with its
    /// expiry pushed past the window so concurrent readers skip the refresh,
    /// and then `mitigation` runs. The value read is returned either way.
    pub fn get<V: DeserializeOwned>(
        &self,
        key: &CacheKey,
        mitigation: Option<&dyn Fn()>,
    ) -> Option<V> {
        if key.is_empty() {
            return None;
        }
        let hashed = self.hash(key);
        let bytes = match self.backend.get(&hashed) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                counter!(METRIC_MISS).increment(1);
                return None;
            }
            Err(err) => {
                error!(key = %key, error = %err, "Caching backend down");
                counter!(METRIC_BACKEND_ERROR, "op" => "get").increment(1);
                return None;
            }
        };
        let entry: StoredEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %key, error = %err, "Discarding undecodable cache entry");
                counter!(METRIC_MISS).increment(1);
                return None;
            }
        };
        if entry.value.is_null() {
            counter!(METRIC_MISS).increment(1);
            return None;
        }

        debug!(key = %key, expires_at = %entry.expires_at, "Cache hit");
        counter!(METRIC_HIT).increment(1);

        let value = entry.value;
        if let Some(mitigate) = mitigation {
            let now = OffsetDateTime::now_utc();
            let window_edge = now.checked_add(self.config.mitigation_window());
            let pushed_to = now.checked_add(self.config.mitigation_push());
            if let (Some(window_edge), Some(pushed_to)) = (window_edge, pushed_to)
                && entry.expires_at < window_edge
            {
                let pushed = StoredEntry {
                    value: value.clone(),
                    expires_at: pushed_to,
                };
                debug!(key = %key, expires_at = %pushed.expires_at, "Mitigating cache stampede");
                counter!(METRIC_MITIGATION).increment(1);
                self.write_entry(key, pushed, None);
                mitigate();
            }
        }

        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %key, error = %err, "Cached value does not match requested type");
                None
            }
        }
    }

    /// Soft invalidation: re-write the current entry with the short
    /// invalidation TTL so it lapses almost immediately.
    pub fn invalidate(&self, key: &CacheKey) {
        if key.is_empty() {
            return;
        }
        let hashed = self.hash(key);
        let current = match self.backend.get(&hashed) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(err) => {
                error!(key = %key, error = %err, "Caching backend down");
                counter!(METRIC_BACKEND_ERROR, "op" => "invalidate").increment(1);
                return;
            }
        };
        debug!(key = %key, "Soft-invalidating cache entry");
        counter!(METRIC_INVALIDATE).increment(1);
        if let Err(err) = self
            .backend
            .set(&hashed, current, Some(self.config.invalidate_ttl()))
        {
            error!(key = %key, error = %err, "Caching backend down");
            counter!(METRIC_BACKEND_ERROR, "op" => "invalidate").increment(1);
        }
    }

    fn write_entry(&self, key: &CacheKey, entry: StoredEntry, ttl: Option<Duration>) {
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to encode cache entry");
                return;
            }
        };
        let ttl = ttl.or_else(|| self.config.backend_ttl());
        debug!(key = %key, expires_at = %entry.expires_at, "Setting cache entry");
        if let Err(err) = self.backend.set(&self.hash(key), bytes, ttl) {
            error!(key = %key, error = %err, "Caching backend down");
            counter!(METRIC_BACKEND_ERROR, "op" => "set").increment(1);
        }
    }
}

//! Cache configuration.
//!
//! Controls key namespacing, logical expiry and stampede mitigation.

use serde::Deserialize;

// Default values for cache configuration
pub(crate) const DEFAULT_EXPIRATION_HOURS: u64 = 12;
pub(crate) const DEFAULT_MITIGATE_AT_MINUTES: u64 = 5;
pub(crate) const DEFAULT_BACKEND_TTL_SECS: u64 = 0;
pub(crate) const DEFAULT_INVALIDATE_TTL_SECS: u64 = 1;

/// Cache configuration, read once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace prepended to every key before hashing.
    pub key_prefix: String,
    /// Logical expiry recorded with each entry.
    pub expiration_hours: u64,
    /// Entries this close to their logical expiry are refreshed on read.
    pub mitigate_at_minutes: u64,
    /// Backend eviction TTL; zero leaves eviction to the backend.
    pub backend_ttl_secs: u64,
    /// Backend TTL applied by soft invalidation.
    pub invalidate_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            expiration_hours: DEFAULT_EXPIRATION_HOURS,
            mitigate_at_minutes: DEFAULT_MITIGATE_AT_MINUTES,
            backend_ttl_secs: DEFAULT_BACKEND_TTL_SECS,
            invalidate_ttl_secs: DEFAULT_INVALIDATE_TTL_SECS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            key_prefix: settings.key_prefix.clone(),
            expiration_hours: settings.expiration_hours.get(),
            mitigate_at_minutes: settings.mitigate_at_minutes,
            backend_ttl_secs: settings.backend_ttl_secs,
            invalidate_ttl_secs: settings.invalidate_ttl_secs.get(),
        }
    }
}

impl CacheConfig {
    pub fn expiration(&self) -> time::Duration {
        seconds(self.expiration_hours.saturating_mul(3600))
    }

    pub fn mitigation_window(&self) -> time::Duration {
        seconds(self.mitigate_at_minutes.saturating_mul(60))
    }

    /// How far a mitigated entry's expiry is pushed: one minute past the window.
    pub fn mitigation_push(&self) -> time::Duration {
        seconds(self.mitigate_at_minutes.saturating_add(1).saturating_mul(60))
    }

    pub fn backend_ttl(&self) -> Option<std::time::Duration> {
        (self.backend_ttl_secs > 0).then(|| std::time::Duration::from_secs(self.backend_ttl_secs))
    }

    /// Clamped to at least one second.
    pub fn invalidate_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.invalidate_ttl_secs.max(1))
    }
}

fn seconds(value: u64) -> time::Duration {
    time::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.key_prefix, "");
        assert_eq!(config.expiration_hours, 12);
        assert_eq!(config.mitigate_at_minutes, 5);
        assert_eq!(config.backend_ttl_secs, 0);
        assert_eq!(config.invalidate_ttl_secs, 1);
    }

    #[test]
    fn derived_durations() {
        let config = CacheConfig::default();
        assert_eq!(config.expiration(), time::Duration::hours(12));
        assert_eq!(config.mitigation_window(), time::Duration::minutes(5));
        assert_eq!(config.mitigation_push(), time::Duration::minutes(6));
        assert_eq!(config.backend_ttl(), None);
        assert_eq!(config.invalidate_ttl(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn backend_ttl_when_configured() {
        let config = CacheConfig {
            backend_ttl_secs: 90,
            ..Default::default()
        };
        assert_eq!(
            config.backend_ttl(),
            Some(std::time::Duration::from_secs(90))
        );
    }

    #[test]
    fn invalidate_ttl_clamps_to_one_second() {
        let config = CacheConfig {
            invalidate_ttl_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.invalidate_ttl(), std::time::Duration::from_secs(1));
    }
}

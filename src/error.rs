use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced to callers of the cache façade, lookups, references and
/// memoized computations.
///
/// A miss answered from a cached sentinel and a miss answered by the store
/// both come back as [`CacheError::NotFound`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("entity `{entity}` does not exist")]
    NotFound { entity: &'static str },
    #[error("cache misuse: {message}")]
    Misuse { message: String },
    #[error(transparent)]
    Store(StoreError),
}

impl CacheError {
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for CacheError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { entity } => Self::NotFound { entity },
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry initialization failed: {0}")]
    Install(String),
}

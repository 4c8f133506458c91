//! Cache-first single-result lookups.

use tracing::debug;

use super::entity::{CacheEntity, Cached, EntityCache};
use crate::error::CacheError;
use crate::store::{Filter, StoreError};

/// Store queries that consult the [`EntityCache`] first.
///
/// Single-term filters are answered from cache when possible; misses fall
/// back to the store and populate the cache with the entity or with the
/// not-found sentinel.
pub struct CachedLookup<E: CacheEntity> {
    cache: EntityCache<E>,
}

impl<E: CacheEntity> CachedLookup<E> {
    pub fn new(cache: EntityCache<E>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &EntityCache<E> {
        &self.cache
    }

    pub fn get(&self, filter: &Filter) -> Result<E, CacheError> {
        if filter.is_empty() {
            return Err(CacheError::misuse(format!(
                "lookup on `{}` needs at least one filter",
                E::TYPE_NAME
            )));
        }

        let cacheable = filter.len() == 1;
        if cacheable && let Some(entity) = self.cache.get_cache(filter)? {
            return Ok(entity);
        }

        debug!(entity_type = E::TYPE_NAME, filter = %filter, "Falling back to store");
        match self.cache.store().get(filter) {
            Ok(entity) => {
                if cacheable {
                    self.cache
                        .set_cache(filter, Cached::Present(entity.clone()), None)?;
                }
                Ok(entity)
            }
            Err(StoreError::NotFound { entity }) => {
                if cacheable {
                    self.cache.set_cache(filter, Cached::NotFound, None)?;
                }
                Err(CacheError::not_found(entity))
            }
            Err(err) => Err(err.into()),
        }
    }
}

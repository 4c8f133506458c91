//! Lazily resolved references to other entities.
//!
//! A [`CachedRef`] stores the referenced identifier and a per-instance slot
//! for the resolved entity. The slot moves through three states:
//! unresolved, resolved, and invalidated (cleared after the owning entity is
//! saved). Only the identifier is serialized, so a copy read back from cache
//! always re-resolves.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entity::{CacheEntity, Cached, EntityCache};
use crate::error::CacheError;
use crate::store::{EntityId, EntityStore, Filter, Record, StoreError};

#[derive(Debug, Clone)]
enum RefState<E> {
    Unresolved,
    Resolved(E),
    Invalidated,
}

impl<E> Default for RefState<E> {
    fn default() -> Self {
        Self::Unresolved
    }
}

/// Reference to an `E` by identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct CachedRef<E> {
    id: Option<EntityId>,
    #[serde(skip)]
    state: RefState<E>,
}

impl<E> Default for CachedRef<E> {
    fn default() -> Self {
        Self {
            id: None,
            state: RefState::Unresolved,
        }
    }
}

impl<E: Record> CachedRef<E> {
    pub fn new(id: Option<EntityId>) -> Self {
        Self {
            id,
            state: RefState::Unresolved,
        }
    }

    /// Reference `target`, keeping it as the resolved value.
    pub fn to(target: &E) -> Self {
        let mut reference = Self::default();
        reference.set(target);
        reference
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    pub fn set(&mut self, target: &E) {
        self.id = target.id();
        self.state = match self.id {
            Some(_) => RefState::Resolved(target.clone()),
            None => RefState::Unresolved,
        };
    }

    pub fn set_id(&mut self, id: Option<EntityId>) {
        self.id = id;
        self.state = RefState::Unresolved;
    }

    /// The resolved entity, without loading it.
    pub fn get(&self) -> Option<&E> {
        match &self.state {
            RefState::Resolved(entity) => Some(entity),
            RefState::Unresolved | RefState::Invalidated => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, RefState::Resolved(_))
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(self.state, RefState::Invalidated)
    }

    /// Forget the resolved entity; the next access resolves again.
    pub fn clear(&mut self) {
        if self.is_resolved() {
            self.state = RefState::Invalidated;
        }
    }

    /// Resolve straight from the store, for referenced types without a cache.
    pub fn resolve_uncached(
        &mut self,
        store: &dyn EntityStore<E>,
    ) -> Result<Option<&E>, CacheError> {
        let Some(id) = self.id else {
            return Ok(None);
        };
        if !self.is_resolved() {
            let entity = store.get(&Filter::id(id))?;
            self.state = RefState::Resolved(entity);
        }
        Ok(self.get())
    }
}

impl<E: CacheEntity> CachedRef<E> {
    /// Resolve through the referenced type's cache.
    ///
    /// A cache miss, or a cached not-found, is re-checked against the store
    /// and an entity found there is cached. `Ok(None)` means the reference is
    /// unset; a missing target is [`CacheError::NotFound`].
    pub fn resolve(&mut self, cache: &EntityCache<E>) -> Result<Option<&E>, CacheError> {
        let Some(id) = self.id else {
            return Ok(None);
        };
        if !self.is_resolved() {
            let entity = load_through_cache(cache, id)?;
            self.state = RefState::Resolved(entity);
        }
        Ok(self.get())
    }
}

fn load_through_cache<E: CacheEntity>(
    cache: &EntityCache<E>,
    id: EntityId,
) -> Result<E, CacheError> {
    let filter = Filter::id(id);
    match cache.get_cache(&filter) {
        Ok(Some(entity)) => return Ok(entity),
        Ok(None) => {}
        Err(err) if err.is_not_found() => {
            debug!(entity_type = E::TYPE_NAME, id, "Cached sentinel, re-checking store");
        }
        Err(err) => return Err(err),
    }

    match cache.store().get(&filter) {
        Ok(entity) => {
            cache.set_cache(&filter, Cached::Present(entity.clone()), None)?;
            Ok(entity)
        }
        Err(StoreError::NotFound { entity }) => Err(CacheError::not_found(entity)),
        Err(err) => Err(err.into()),
    }
}

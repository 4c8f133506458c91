//! Per-entity-type cache-aside façade.
//!
//! Maps a single equality filter to a cache key, stores entities (or the
//! [`Cached::NotFound`] sentinel) through the [`CacheMachine`], and answers
//! lookups with the same not-found error the store would raise.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::keys::CacheKey;
use super::machine::CacheMachine;
use super::registry::CacheRegistry;
use crate::error::CacheError;
use crate::store::{EntityId, EntityStore, Filter, Record, StoreError};

/// An entity the façade can cache.
pub trait CacheEntity: Record + Serialize + DeserializeOwned {
    /// Flag the instance as sourced from cache.
    fn mark_cached(&mut self) {}

    /// Discard uncommitted local mutations before the instance is handed out.
    fn reset(&mut self) {}

    /// Drop resolved references so they re-resolve on next access.
    fn clear_references(&mut self) {}
}

/// A cached lookup result: the entity, or confirmation that it is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cached<E> {
    Present(E),
    NotFound,
}

impl<E> Cached<E> {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn into_present(self) -> Option<E> {
        match self {
            Self::Present(entity) => Some(entity),
            Self::NotFound => None,
        }
    }
}

enum FilterField {
    Identifier,
    IdentifierLookup,
    Other,
}

impl FilterField {
    fn classify(field: &str) -> Self {
        let (base, lookup) = match field.split_once("__") {
            Some((base, lookup)) => (base, Some(lookup)),
            None => (field, None),
        };
        if base != "id" && base != "pk" {
            return Self::Other;
        }
        match lookup {
            None | Some("exact") => Self::Identifier,
            Some(_) => Self::IdentifierLookup,
        }
    }
}

/// Cache-aside access to entities of type `E`.
pub struct EntityCache<E: CacheEntity> {
    machine: Arc<CacheMachine>,
    registry: Arc<CacheRegistry>,
    store: Arc<dyn EntityStore<E>>,
}

impl<E: CacheEntity> Clone for EntityCache<E> {
    fn clone(&self) -> Self {
        Self {
            machine: self.machine.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
        }
    }
}

impl<E: CacheEntity> EntityCache<E> {
    pub fn new(
        machine: Arc<CacheMachine>,
        registry: Arc<CacheRegistry>,
        store: Arc<dyn EntityStore<E>>,
    ) -> Self {
        Self {
            machine,
            registry,
            store,
        }
    }

    pub fn machine(&self) -> &Arc<CacheMachine> {
        &self.machine
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn EntityStore<E>> {
        &self.store
    }

    /// Cache key for a single-term filter.
    ///
    /// `Ok(None)` means the lookup is not cacheable: a non-identifier field
    /// without a registered key builder, or a non-exact identifier lookup.
    pub fn cache_key(&self, filter: &Filter) -> Result<Option<CacheKey>, CacheError> {
        let (field, value) = filter.single().ok_or_else(|| {
            CacheError::misuse(format!(
                "cache lookups on `{}` take exactly one filter, got {}",
                E::TYPE_NAME,
                filter.len()
            ))
        })?;
        let key = match FilterField::classify(field) {
            FilterField::Identifier => Some(CacheKey::for_entity(E::TYPE_NAME, value)),
            FilterField::IdentifierLookup => None,
            FilterField::Other => self
                .registry
                .key_builder(E::TYPE_NAME, field)
                .map(|builder| builder(value)),
        };
        if key.is_none() {
            debug!(entity_type = E::TYPE_NAME, field, "Lookup is not cacheable");
        }
        Ok(key)
    }

    /// Store `value` under the key for `filter`. A present entity is marked
    /// as cached first. Uncacheable filters are a no-op.
    pub fn set_cache(
        &self,
        filter: &Filter,
        value: Cached<E>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let Some(key) = self.cache_key(filter)? else {
            return Ok(());
        };
        let value = match value {
            Cached::Present(mut entity) => {
                entity.mark_cached();
                Cached::Present(entity)
            }
            Cached::NotFound => Cached::NotFound,
        };
        self.machine.set(&key, &value, ttl);
        Ok(())
    }

    /// Write `entity` through under its identifier and under every field
    /// with a registered key builder, marking the caller's instance as
    /// cached.
    pub fn cache_entity(&self, entity: &mut E) -> Result<(), CacheError> {
        let filters = self.entity_filters(entity)?;
        entity.mark_cached();
        for filter in &filters {
            self.set_cache(filter, Cached::Present(entity.clone()), None)?;
        }
        Ok(())
    }

    /// Record that `id` no longer exists.
    pub fn cache_not_found(&self, id: EntityId) -> Result<(), CacheError> {
        self.set_cache(&Filter::id(id), Cached::NotFound, None)
    }

    /// Record that `entity` no longer exists, under its identifier and its
    /// keyed fields.
    pub fn cache_deleted(&self, entity: &E) -> Result<(), CacheError> {
        for filter in &self.entity_filters(entity)? {
            self.set_cache(filter, Cached::NotFound, None)?;
        }
        Ok(())
    }

    /// Soft-invalidate every entry `entity` is cached under.
    pub fn invalidate_entity(&self, entity: &E) -> Result<(), CacheError> {
        for filter in &self.entity_filters(entity)? {
            self.invalidate_cache(filter)?;
        }
        Ok(())
    }

    /// Identifier filter first, then one filter per keyed field the entity
    /// has a value for.
    fn entity_filters(&self, entity: &E) -> Result<Vec<Filter>, CacheError> {
        let id = entity
            .id()
            .ok_or_else(|| CacheError::misuse("cannot cache an unsaved entity"))?;
        let keyed = self
            .registry
            .keyed_fields(E::TYPE_NAME)
            .into_iter()
            .filter_map(|field| {
                let value = entity.field(&field)?;
                Some(Filter::by(field, value))
            });
        Ok(std::iter::once(Filter::id(id)).chain(keyed).collect())
    }

    /// Cached entity for `filter`.
    ///
    /// `Ok(None)` is a miss (or an uncacheable filter) and the caller should
    /// fall back to the store. A cached [`Cached::NotFound`] is returned as
    /// [`CacheError::NotFound`]. Entries near expiry are refreshed from the
    /// store while the current value is served.
    pub fn get_cache(&self, filter: &Filter) -> Result<Option<E>, CacheError> {
        let Some(key) = self.cache_key(filter)? else {
            return Ok(None);
        };
        let mitigate = self.wrap_for_mitigation(filter);
        match self.machine.get::<Cached<E>>(&key, Some(&mitigate)) {
            None => Ok(None),
            Some(Cached::NotFound) => Err(CacheError::not_found(E::TYPE_NAME)),
            Some(Cached::Present(mut entity)) => {
                entity.reset();
                Ok(Some(entity))
            }
        }
    }

    /// Soft-invalidate the entry for `filter`.
    pub fn invalidate_cache(&self, filter: &Filter) -> Result<(), CacheError> {
        if let Some(key) = self.cache_key(filter)? {
            self.machine.invalidate(&key);
        }
        Ok(())
    }

    /// Callback that re-fetches `filter` from the store and re-caches it.
    pub fn wrap_for_mitigation<'a>(&'a self, filter: &'a Filter) -> impl Fn() + 'a {
        move || self.refresh_from_store(filter)
    }

    /// Re-fetch `filter` from the store and overwrite its cache entry.
    ///
    /// A store miss is cached as [`Cached::NotFound`]; other store failures
    /// leave the entry alone.
    pub fn refresh_from_store(&self, filter: &Filter) {
        let refreshed = match self.store.get(filter) {
            Ok(entity) => Cached::Present(entity),
            Err(StoreError::NotFound { .. }) => Cached::NotFound,
            Err(err) => {
                warn!(
                    entity_type = E::TYPE_NAME,
                    filter = %filter,
                    error = %err,
                    "Cache refresh skipped: store lookup failed"
                );
                return;
            }
        };
        if let Err(err) = self.set_cache(filter, refreshed, None) {
            warn!(
                entity_type = E::TYPE_NAME,
                filter = %filter,
                error = %err,
                "Cache refresh skipped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::cache::config::CacheConfig;
    use crate::store::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Gadget {
        id: Option<EntityId>,
        name: String,
        #[serde(default)]
        cached: bool,
        #[serde(default)]
        resets: u32,
    }

    impl Record for Gadget {
        const TYPE_NAME: &'static str = "shop.Gadget";

        fn id(&self) -> Option<EntityId> {
            self.id
        }

        fn assign_id(&mut self, id: EntityId) {
            self.id = Some(id);
        }

        fn field(&self, name: &str) -> Option<String> {
            (name == "name").then(|| self.name.clone())
        }
    }

    impl CacheEntity for Gadget {
        fn mark_cached(&mut self) {
            self.cached = true;
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    fn gadget(name: &str) -> Gadget {
        Gadget {
            id: None,
            name: name.to_string(),
            cached: false,
            resets: 0,
        }
    }

    fn fixture() -> (Arc<MemoryStore<Gadget>>, EntityCache<Gadget>) {
        let backend = Arc::new(MemoryBackend::new());
        let machine = Arc::new(CacheMachine::new(backend, CacheConfig::default()));
        let store = Arc::new(MemoryStore::<Gadget>::new());
        let cache: EntityCache<Gadget> =
            EntityCache::new(machine, Arc::new(CacheRegistry::new()), store.clone());
        (store, cache)
    }

    fn key(cache: &EntityCache<Gadget>, filter: Filter) -> Option<String> {
        cache
            .cache_key(&filter)
            .expect("single filter")
            .map(|key| key.as_str().to_string())
    }

    #[test]
    fn identifier_aliases_share_one_key() {
        let (_, cache) = fixture();
        let expected = Some("shop.Gadget::7".to_string());

        assert_eq!(key(&cache, Filter::by("id", 7)), expected);
        assert_eq!(key(&cache, Filter::by("pk", 7)), expected);
        assert_eq!(key(&cache, Filter::by("id__exact", 7)), expected);
        assert_eq!(key(&cache, Filter::by("pk__exact", 7)), expected);
        assert_eq!(key(&cache, Filter::by("id__in", 7)), None);
    }

    #[test]
    fn identifier_like_field_names_are_not_identifiers() {
        let (_, cache) = fixture();
        assert_eq!(key(&cache, Filter::by("account_id", 7)), None);
    }

    #[test]
    fn non_identifier_field_uses_registered_builder() {
        let (_, cache) = fixture();
        assert_eq!(key(&cache, Filter::by("name", "gear")), None);

        cache
            .registry()
            .register_key_builder("shop.Gadget", "name", |value| {
                CacheKey::new(format!("shop.Gadget::name::{value}"))
            });

        assert_eq!(
            key(&cache, Filter::by("name", "gear")),
            Some("shop.Gadget::name::gear".to_string())
        );
    }

    fn register_name_key(cache: &EntityCache<Gadget>) {
        cache
            .registry()
            .register_key_builder("shop.Gadget", "name", |value| {
                CacheKey::new(format!("shop.Gadget::name::{value}"))
            });
    }

    #[test]
    fn cache_entity_overwrites_keyed_field_sentinels() {
        let (store, cache) = fixture();
        register_name_key(&cache);
        let by_name = Filter::by("name", "gear");
        cache
            .set_cache(&by_name, Cached::NotFound, None)
            .expect("sentinel");

        let mut saved = gadget("gear");
        store.save(&mut saved).expect("save");
        cache.cache_entity(&mut saved).expect("write through");

        let hit = cache.get_cache(&by_name).expect("hit").expect("present");
        assert_eq!(hit.id, saved.id);
        assert_eq!(store.query_count(), 0);
    }

    #[test]
    fn cache_deleted_covers_keyed_fields() {
        let (store, cache) = fixture();
        register_name_key(&cache);
        let mut saved = gadget("gear");
        store.save(&mut saved).expect("save");
        cache.cache_entity(&mut saved).expect("write through");

        cache.cache_deleted(&saved).expect("forget");

        let by_name = cache.get_cache(&Filter::by("name", "gear"));
        assert!(by_name.expect_err("deleted").is_not_found());
        let by_id = cache.get_cache(&Filter::id(saved.id.expect("id")));
        assert!(by_id.expect_err("deleted").is_not_found());
    }

    #[test]
    fn zero_or_many_filters_is_misuse() {
        let (_, cache) = fixture();

        assert!(matches!(
            cache.cache_key(&Filter::default()),
            Err(CacheError::Misuse { .. })
        ));
        assert!(matches!(
            cache.get_cache(&Filter::id(1).and("name", "gear")),
            Err(CacheError::Misuse { .. })
        ));
    }

    #[test]
    fn set_then_get_marks_cached_and_resets() {
        let (_, cache) = fixture();
        let mut item = gadget("gear");
        item.id = Some(1);

        cache
            .set_cache(&Filter::id(1), Cached::Present(item), None)
            .expect("set");
        let first = cache.get_cache(&Filter::id(1)).expect("get").expect("hit");
        let second = cache.get_cache(&Filter::by("pk", 1)).expect("get").expect("hit");

        assert_eq!(first.name, "gear");
        assert!(first.cached);
        assert_eq!(first.resets, 1);
        assert_eq!(second.resets, 1, "each caller gets its own reset copy");
    }

    #[test]
    fn cached_not_found_surfaces_as_not_found() {
        let (_, cache) = fixture();
        cache.cache_not_found(9).expect("set");

        let error = cache.get_cache(&Filter::id(9)).expect_err("sentinel");
        assert!(error.is_not_found());
    }

    #[test]
    fn uncacheable_filters_miss_quietly() {
        let (_, cache) = fixture();
        cache
            .set_cache(&Filter::by("name", "gear"), Cached::NotFound, None)
            .expect("no-op");

        assert_eq!(cache.get_cache(&Filter::by("name", "gear")).expect("miss"), None);
    }

    #[test]
    fn cache_entity_requires_an_identifier() {
        let (_, cache) = fixture();
        let mut unsaved = gadget("loose");

        assert!(matches!(
            cache.cache_entity(&mut unsaved),
            Err(CacheError::Misuse { .. })
        ));
    }

    #[test]
    fn near_expiry_entry_is_refreshed_from_store() {
        let (store, cache) = fixture();
        let mut item = gadget("old");
        store.save(&mut item).expect("save");
        let key = cache
            .cache_key(&Filter::id(1))
            .expect("key")
            .expect("cacheable");
        let soon = OffsetDateTime::now_utc() + time::Duration::minutes(1);
        cache
            .machine()
            .set_until(&key, &Cached::Present(item.clone()), None, soon);

        item.name = "new".to_string();
        store.save(&mut item).expect("update");

        let served = cache.get_cache(&Filter::id(1)).expect("get").expect("hit");
        assert_eq!(served.name, "old", "current value is served during refresh");

        let refreshed = cache.get_cache(&Filter::id(1)).expect("get").expect("hit");
        assert_eq!(refreshed.name, "new");
    }

    #[test]
    fn refresh_caches_store_misses() {
        let (_, cache) = fixture();
        cache.refresh_from_store(&Filter::id(42));

        assert!(cache.get_cache(&Filter::id(42)).expect_err("dne").is_not_found());
    }

    #[test]
    fn invalidate_keeps_value_until_short_ttl_lapses() {
        let (_, cache) = fixture();
        let mut item = gadget("gear");
        item.id = Some(3);
        cache.cache_entity(&mut item).expect("cache");
        assert!(item.cached);

        cache.invalidate_cache(&Filter::id(3)).expect("invalidate");
        assert!(cache.get_cache(&Filter::id(3)).expect("get").is_some());

        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get_cache(&Filter::id(3)).expect("get").is_none());
    }
}

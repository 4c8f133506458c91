//! Save and delete paths that keep the cache and the watches informed.
//!
//! [`Repository`] persists entities and publishes lifecycle events.
//! [`CachedRepository`] additionally writes saved entities through to the
//! [`EntityCache`] and records deletions as cached not-found.

use std::sync::Arc;

use super::entity::{CacheEntity, EntityCache};
use super::events::EventKind;
use super::lookup::CachedLookup;
use super::machine::CacheMachine;
use super::registry::CacheRegistry;
use crate::error::CacheError;
use crate::store::{EntityStore, Filter, Record};

/// Store access that publishes lifecycle events.
pub struct Repository<E: Record> {
    store: Arc<dyn EntityStore<E>>,
    registry: Arc<CacheRegistry>,
}

impl<E: Record> Repository<E> {
    /// Creating the repository defines `E` in the registry, binding any
    /// watches that referenced it by name.
    pub fn new(store: Arc<dyn EntityStore<E>>, registry: Arc<CacheRegistry>) -> Self {
        registry.define_type(E::TYPE_NAME);
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore<E>> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    pub fn get(&self, filter: &Filter) -> Result<E, CacheError> {
        Ok(self.store.get(filter)?)
    }

    pub fn save(&self, entity: &mut E) -> Result<EventKind, CacheError> {
        let kind = EventKind::from_save(self.store.save(entity)?);
        self.registry.publish(kind, entity, false);
        Ok(kind)
    }

    /// Save as part of a bulk or fixture load. Watches receive the event
    /// flagged as raw.
    pub fn save_raw(&self, entity: &mut E) -> Result<EventKind, CacheError> {
        let kind = EventKind::from_save(self.store.save(entity)?);
        self.registry.publish(kind, entity, true);
        Ok(kind)
    }

    pub fn delete(&self, entity: &E) -> Result<(), CacheError> {
        self.store.delete(entity)?;
        self.registry.publish(EventKind::Deleted, entity, false);
        Ok(())
    }
}

/// Repository for a cached entity type.
pub struct CachedRepository<E: CacheEntity> {
    inner: Repository<E>,
    lookup: CachedLookup<E>,
}

impl<E: CacheEntity> CachedRepository<E> {
    pub fn new(
        machine: Arc<CacheMachine>,
        registry: Arc<CacheRegistry>,
        store: Arc<dyn EntityStore<E>>,
    ) -> Self {
        let cache = EntityCache::new(machine, registry.clone(), store.clone());
        Self {
            inner: Repository::new(store, registry),
            lookup: CachedLookup::new(cache),
        }
    }

    pub fn cache(&self) -> &EntityCache<E> {
        self.lookup.cache()
    }

    pub fn lookup(&self) -> &CachedLookup<E> {
        &self.lookup
    }

    pub fn store(&self) -> &Arc<dyn EntityStore<E>> {
        self.inner.store()
    }

    /// Cache-first lookup.
    pub fn get(&self, filter: &Filter) -> Result<E, CacheError> {
        self.lookup.get(filter)
    }

    /// Persist `entity`, drop its resolved references, write it through
    /// under its identifier and keyed fields, then notify watches.
    pub fn save(&self, entity: &mut E) -> Result<EventKind, CacheError> {
        let kind = EventKind::from_save(self.inner.store.save(entity)?);
        entity.clear_references();
        self.cache().cache_entity(entity)?;
        self.inner.registry.publish(kind, entity, false);
        Ok(kind)
    }

    /// Bulk-load save: the cached copy is soft-invalidated rather than
    /// written through, and watches see a raw event.
    pub fn save_raw(&self, entity: &mut E) -> Result<EventKind, CacheError> {
        let kind = self.inner.save_raw(entity)?;
        self.cache().invalidate_entity(entity)?;
        Ok(kind)
    }

    /// Delete `entity` and cache its absence under every key it had.
    pub fn delete(&self, entity: &E) -> Result<(), CacheError> {
        self.inner.store.delete(entity)?;
        self.cache().cache_deleted(entity)?;
        self.inner
            .registry
            .publish(EventKind::Deleted, entity, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::cache::config::CacheConfig;
    use crate::cache::reference::CachedRef;
    use crate::store::{EntityId, MemoryStore};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Author {
        id: Option<EntityId>,
        name: String,
    }

    impl Record for Author {
        const TYPE_NAME: &'static str = "blog.Author";

        fn id(&self) -> Option<EntityId> {
            self.id
        }

        fn assign_id(&mut self, id: EntityId) {
            self.id = Some(id);
        }
    }

    impl CacheEntity for Author {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Post {
        id: Option<EntityId>,
        author: CachedRef<Author>,
    }

    impl Record for Post {
        const TYPE_NAME: &'static str = "blog.Post";

        fn id(&self) -> Option<EntityId> {
            self.id
        }

        fn assign_id(&mut self, id: EntityId) {
            self.id = Some(id);
        }
    }

    impl CacheEntity for Post {
        fn clear_references(&mut self) {
            self.author.clear();
        }
    }

    struct Fixture {
        registry: Arc<CacheRegistry>,
        authors_store: Arc<MemoryStore<Author>>,
        authors: CachedRepository<Author>,
        posts: CachedRepository<Post>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let machine = Arc::new(CacheMachine::new(backend, CacheConfig::default()));
        let registry = Arc::new(CacheRegistry::new());
        let authors_store = Arc::new(MemoryStore::<Author>::new());
        let authors: CachedRepository<Author> =
            CachedRepository::new(machine.clone(), registry.clone(), authors_store.clone());
        let posts: CachedRepository<Post> =
            CachedRepository::new(machine, registry.clone(), Arc::new(MemoryStore::new()));
        Fixture {
            registry,
            authors_store,
            authors,
            posts,
        }
    }

    fn author(name: &str) -> Author {
        Author {
            id: None,
            name: name.to_string(),
        }
    }

    fn record_events(registry: &CacheRegistry) -> Arc<Mutex<Vec<(EventKind, bool)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        registry.watch_type::<Author, _>("test:events", move |event| {
            sink.lock().expect("sink").push((event.kind, event.raw));
        });
        events
    }

    #[test]
    fn repositories_define_their_types() {
        let fixture = fixture();
        assert!(fixture.registry.is_defined("blog.Author"));
        assert!(fixture.registry.is_defined("blog.Post"));
    }

    #[test]
    fn save_writes_through_and_publishes() {
        let fixture = fixture();
        let events = record_events(&fixture.registry);
        let mut ada = author("ada");

        assert_eq!(fixture.authors.save(&mut ada).expect("create"), EventKind::Created);
        ada.name = "ada lovelace".to_string();
        assert_eq!(fixture.authors.save(&mut ada).expect("update"), EventKind::Updated);

        let cached = fixture.authors.get(&Filter::id(1)).expect("cached");
        assert_eq!(cached.name, "ada lovelace");
        assert_eq!(fixture.authors_store.query_count(), 0, "served by write-through");
        assert_eq!(
            *events.lock().expect("events"),
            vec![(EventKind::Created, false), (EventKind::Updated, false)]
        );
    }

    #[test]
    fn delete_caches_absence() {
        let fixture = fixture();
        let events = record_events(&fixture.registry);
        let mut ada = author("ada");
        fixture.authors.save(&mut ada).expect("save");

        fixture.authors.delete(&ada).expect("delete");

        assert!(fixture.authors.get(&Filter::id(1)).expect_err("gone").is_not_found());
        assert_eq!(fixture.authors_store.query_count(), 0);
        assert_eq!(events.lock().expect("events").last(), Some(&(EventKind::Deleted, false)));
    }

    #[test]
    fn raw_save_flags_the_event() {
        let fixture = fixture();
        let events = record_events(&fixture.registry);

        fixture.authors.save_raw(&mut author("fixture")).expect("raw");

        assert_eq!(*events.lock().expect("events"), vec![(EventKind::Created, true)]);
    }

    #[test]
    fn save_clears_resolved_references() {
        let fixture = fixture();
        let mut ada = author("ada");
        fixture.authors.save(&mut ada).expect("author");
        let mut post = Post {
            id: None,
            author: CachedRef::to(&ada),
        };
        assert!(post.author.is_resolved());

        fixture.posts.save(&mut post).expect("post");

        assert!(post.author.is_invalidated());
        let resolved = post
            .author
            .resolve(fixture.authors.cache())
            .expect("resolve")
            .map(|a| a.name.clone());
        assert_eq!(resolved.as_deref(), Some("ada"));
    }

    #[test]
    fn plain_repository_publishes_without_caching() {
        let registry = Arc::new(CacheRegistry::new());
        let store = Arc::new(MemoryStore::<Author>::new());
        let repository: Repository<Author> = Repository::new(store.clone(), registry.clone());
        let events = record_events(&registry);

        let mut ada = author("ada");
        repository.save(&mut ada).expect("save");
        repository.delete(&ada).expect("delete");

        assert!(repository.get(&Filter::id(1)).expect_err("gone").is_not_found());
        assert_eq!(
            *events.lock().expect("events"),
            vec![(EventKind::Created, false), (EventKind::Deleted, false)]
        );
    }
}

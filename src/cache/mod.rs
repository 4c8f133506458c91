//! Herdcache caching engine.
//!
//! Read-through/write-through caching in front of a persistent store:
//!
//! - **Cache machine**: hashed keys, `(value, expires_at)` entries and
//!   stampede mitigation over a [`CacheBackend`]
//! - **Entity façade**: cache-aside lookups per entity type, with a
//!   not-found sentinel for negative caching
//! - **Memoized computations**: derived values refreshed by lifecycle events
//!   of the entity types they watch
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `herdcache.toml`:
//!
//! ```toml
//! [cache]
//! key_prefix = "prod:"
//! expiration_hours = 12
//! mitigate_at_minutes = 5
//! # ... see config.rs for all options
//! ```

mod backend;
mod config;
mod entity;
mod events;
mod keys;
pub(crate) mod lock;
mod lookup;
mod machine;
mod memo;
mod reference;
mod registry;
mod repository;

pub use backend::{BackendError, CacheBackend, MemoryBackend};
pub use config::CacheConfig;
pub(crate) use config::{
    DEFAULT_BACKEND_TTL_SECS, DEFAULT_EXPIRATION_HOURS, DEFAULT_INVALIDATE_TTL_SECS,
    DEFAULT_MITIGATE_AT_MINUTES,
};
pub use entity::{CacheEntity, Cached, EntityCache};
pub use events::{Epoch, EventKind, LifecycleEvent};
pub use keys::{CacheKey, KeyTemplate, hash_key};
pub use lookup::CachedLookup;
pub use machine::CacheMachine;
pub use memo::{MemoArgs, MemoBuilder, Memoized, Symmetry};
pub use reference::CachedRef;
pub use registry::{CacheRegistry, KeyBuilder, WatchHandler};
pub use repository::{CachedRepository, Repository};

//! Process-wide cache registry.
//!
//! Holds the per-type key-builder table and the watch subscriptions that
//! bind entity lifecycle events to invalidation handlers. One registry is
//! created at startup and passed explicitly to every component that needs it.
//!
//! A watch may name a type that has not been defined yet. Such a
//! subscription waits in a pending table keyed by the lowercased type name
//! and is bound when [`CacheRegistry::define_type`] announces the type.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::events::{EpochCounter, EventKind, LifecycleEvent};
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};
use crate::store::Record;

const SOURCE: &str = "cache::registry";

/// Builds the cache key for a non-identifier filter value.
pub type KeyBuilder = Arc<dyn Fn(&str) -> CacheKey + Send + Sync>;

/// Invalidation handler invoked for each dispatched event.
pub type WatchHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    label: String,
    handler: WatchHandler,
}

#[derive(Default)]
struct WatchTable {
    defined: HashSet<String>,
    bound: HashMap<String, Vec<Subscription>>,
    pending: HashMap<String, Vec<Subscription>>,
}

impl WatchTable {
    fn attach(subscriptions: &mut Vec<Subscription>, subscription: Subscription) {
        match subscriptions
            .iter_mut()
            .find(|existing| existing.label == subscription.label)
        {
            Some(existing) => *existing = subscription,
            None => subscriptions.push(subscription),
        }
    }
}

/// Key builders and watch subscriptions.
pub struct CacheRegistry {
    key_builders: RwLock<HashMap<(String, String), KeyBuilder>>,
    watches: RwLock<WatchTable>,
    epochs: EpochCounter,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            key_builders: RwLock::new(HashMap::new()),
            watches: RwLock::new(WatchTable::default()),
            epochs: EpochCounter::new(),
        }
    }

    /// Make `field` lookups on `type_name` cacheable.
    pub fn register_key_builder<F>(&self, type_name: &str, field: &str, builder: F)
    where
        F: Fn(&str) -> CacheKey + Send + Sync + 'static,
    {
        debug!(entity_type = type_name, field, "Registering cache key builder");
        rw_write(&self.key_builders, SOURCE, "register_key_builder")
            .insert((type_name.to_string(), field.to_string()), Arc::new(builder));
    }

    pub fn key_builder(&self, type_name: &str, field: &str) -> Option<KeyBuilder> {
        rw_read(&self.key_builders, SOURCE, "key_builder")
            .get(&(type_name.to_string(), field.to_string()))
            .cloned()
    }

    /// Fields of `type_name` that have a registered key builder.
    pub fn keyed_fields(&self, type_name: &str) -> Vec<String> {
        let mut fields: Vec<String> = rw_read(&self.key_builders, SOURCE, "keyed_fields")
            .keys()
            .filter(|(owner, _)| owner == type_name)
            .map(|(_, field)| field.clone())
            .collect();
        fields.sort();
        fields
    }

    /// Announce that `type_name` exists, binding any pending watches on it.
    ///
    /// Returns the number of subscriptions that moved from pending to bound.
    pub fn define_type(&self, type_name: &str) -> usize {
        let name = normalize(type_name);
        if rw_read(&self.watches, SOURCE, "define_type.check")
            .defined
            .contains(&name)
        {
            return 0;
        }

        let mut table = rw_write(&self.watches, SOURCE, "define_type");
        if !table.defined.insert(name.clone()) {
            return 0;
        }
        let pending = table.pending.remove(&name).unwrap_or_default();
        let resolved = pending.len();
        let bound = table.bound.entry(name).or_default();
        for subscription in pending {
            WatchTable::attach(bound, subscription);
        }
        if resolved > 0 {
            info!(
                entity_type = type_name,
                resolved, "Bound forward-referenced watches"
            );
        }
        resolved
    }

    pub fn is_defined(&self, type_name: &str) -> bool {
        rw_read(&self.watches, SOURCE, "is_defined")
            .defined
            .contains(&normalize(type_name))
    }

    /// Subscribe `handler` to lifecycle events of the type named `type_name`.
    ///
    /// Names are matched case-insensitively. If the type is not defined yet
    /// the subscription is held until it is. Subscribing the same `label`
    /// twice replaces the earlier handler.
    pub fn watch<F>(&self, type_name: &str, label: impl Into<String>, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let name = normalize(type_name);
        let subscription = Subscription {
            label: label.into(),
            handler: Arc::new(handler),
        };
        let mut table = rw_write(&self.watches, SOURCE, "watch");
        let defined = table.defined.contains(&name);
        debug!(
            entity_type = type_name,
            label = %subscription.label,
            pending = !defined,
            "Registering watch"
        );
        let target = if defined {
            table.bound.entry(name).or_default()
        } else {
            table.pending.entry(name).or_default()
        };
        WatchTable::attach(target, subscription);
    }

    /// Subscribe to a type that is known at compile time; binds immediately.
    pub fn watch_type<W, F>(&self, label: impl Into<String>, handler: F)
    where
        W: Record,
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.define_type(W::TYPE_NAME);
        self.watch(W::TYPE_NAME, label, handler);
    }

    /// Dispatch a lifecycle event for `instance` to every bound watch on its
    /// type. Handlers run on the calling thread after the table lock is
    /// released. Returns the number of handlers invoked.
    pub fn publish<E: Record>(&self, kind: EventKind, instance: &E, raw: bool) -> usize {
        self.define_type(E::TYPE_NAME);
        let event = LifecycleEvent::new(kind, instance, self.epochs.next()).with_raw(raw);

        let handlers: Vec<WatchHandler> = rw_read(&self.watches, SOURCE, "publish")
            .bound
            .get(&normalize(E::TYPE_NAME))
            .map(|subscriptions| {
                subscriptions
                    .iter()
                    .map(|subscription| subscription.handler.clone())
                    .collect()
            })
            .unwrap_or_default();

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = kind.as_str(),
            entity_type = E::TYPE_NAME,
            raw,
            subscribers = handlers.len(),
            "Dispatching lifecycle event"
        );

        for handler in &handlers {
            handler(&event);
        }
        handlers.len()
    }

    /// Bound subscriptions on `type_name`.
    pub fn subscription_count(&self, type_name: &str) -> usize {
        rw_read(&self.watches, SOURCE, "subscription_count")
            .bound
            .get(&normalize(type_name))
            .map_or(0, Vec::len)
    }

    /// Subscriptions still waiting for `type_name` to be defined.
    pub fn pending_count(&self, type_name: &str) -> usize {
        rw_read(&self.watches, SOURCE, "pending_count")
            .pending
            .get(&normalize(type_name))
            .map_or(0, Vec::len)
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(type_name: &str) -> String {
    type_name.to_ascii_lowercase()
}

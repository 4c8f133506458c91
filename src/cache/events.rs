//! Entity lifecycle events.
//!
//! Saves and deletes are published as [`LifecycleEvent`]s and dispatched by
//! the [`CacheRegistry`](super::registry::CacheRegistry) to watch
//! subscriptions on the entity's type.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::store::Record;

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The entity was saved for the first time.
    Created,
    /// An existing entity was saved.
    Updated,
    /// The entity was deleted.
    Deleted,
}

impl EventKind {
    pub fn from_save(created: bool) -> Self {
        if created { Self::Created } else { Self::Updated }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// A post-save or post-delete notification.
#[derive(Clone)]
pub struct LifecycleEvent {
    /// Unique identifier for log correlation.
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub entity_type: &'static str,
    /// Bulk or fixture load that bypasses normal lifecycle semantics.
    pub raw: bool,
    pub timestamp: OffsetDateTime,
    instance: Arc<dyn Any + Send + Sync>,
}

impl LifecycleEvent {
    pub fn new<E: Record>(kind: EventKind, instance: &E, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            entity_type: E::TYPE_NAME,
            raw: false,
            timestamp: OffsetDateTime::now_utc(),
            instance: Arc::new(instance.clone()),
        }
    }

    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// The affected instance, if it is an `E`.
    pub fn instance<E: Any>(&self) -> Option<&E> {
        self.instance.downcast_ref()
    }

    pub fn instance_any(&self) -> &(dyn Any + Send + Sync) {
        self.instance.as_ref()
    }
}

impl fmt::Debug for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleEvent")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .field("kind", &self.kind)
            .field("entity_type", &self.entity_type)
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

/// Source of event epochs.
#[derive(Debug, Default)]
pub struct EpochCounter(AtomicU64);

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Epoch {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityId;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping {
        id: Option<EntityId>,
    }

    impl Record for Ping {
        const TYPE_NAME: &'static str = "tests.Ping";

        fn id(&self) -> Option<EntityId> {
            self.id
        }

        fn assign_id(&mut self, id: EntityId) {
            self.id = Some(id);
        }
    }

    #[test]
    fn event_carries_instance_and_type() {
        let event = LifecycleEvent::new(EventKind::Created, &Ping { id: Some(4) }, 7);

        assert_eq!(event.epoch, 7);
        assert_eq!(event.entity_type, "tests.Ping");
        assert!(!event.raw);
        assert!(!event.id.is_nil());
        assert_eq!(event.instance::<Ping>(), Some(&Ping { id: Some(4) }));
        assert!(event.instance::<String>().is_none());
    }

    #[test]
    fn raw_flag() {
        let event = LifecycleEvent::new(EventKind::Updated, &Ping { id: None }, 0).with_raw(true);
        assert!(event.raw);
    }

    #[test]
    fn save_kinds() {
        assert_eq!(EventKind::from_save(true), EventKind::Created);
        assert_eq!(EventKind::from_save(false), EventKind::Updated);
        assert_eq!(EventKind::Deleted.as_str(), "deleted");
    }

    #[test]
    fn epoch_monotonicity() {
        let counter = EpochCounter::new();
        let e1 = counter.next();
        let e2 = counter.next();
        let e3 = counter.next();
        assert!(e1 < e2 && e2 < e3);
    }
}

//! Memoized computations with event-driven invalidation.
//!
//! A [`Memoized`] caches the result of a computation under a key rendered
//! from a [`KeyTemplate`] and the call arguments. Watches on entity types
//! map each lifecycle event back to call arguments and eagerly recompute
//! the cached value. Symmetric computations also refresh the value keyed by
//! the reversed arguments.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::events::LifecycleEvent;
use super::keys::{CacheKey, KeyTemplate};
use super::machine::CacheMachine;
use super::registry::CacheRegistry;
use crate::error::CacheError;
use crate::store::Record;

const METRIC_MEMO_COMPUTE_MS: &str = "herdcache_memo_compute_ms";

/// Arguments of a memoized computation.
pub trait MemoArgs: Clone + Send + Sync + 'static {
    /// The same arguments in reverse order.
    fn reversed(&self) -> Self;
}

impl MemoArgs for () {
    fn reversed(&self) -> Self {}
}

impl<T: Clone + Send + Sync + 'static> MemoArgs for (T,) {
    fn reversed(&self) -> Self {
        self.clone()
    }
}

impl<T: Clone + Send + Sync + 'static> MemoArgs for (T, T) {
    fn reversed(&self) -> Self {
        (self.1.clone(), self.0.clone())
    }
}

impl<T: Clone + Send + Sync + 'static> MemoArgs for (T, T, T) {
    fn reversed(&self) -> Self {
        (self.2.clone(), self.1.clone(), self.0.clone())
    }
}

impl<T: Clone + Send + Sync + 'static> MemoArgs for Vec<T> {
    fn reversed(&self) -> Self {
        self.iter().rev().cloned().collect()
    }
}

/// Whether invalidation also refreshes a mirrored key.
pub enum Symmetry<A> {
    Off,
    /// Also refresh the value for the reversed arguments.
    Reversed,
    /// Also refresh the value for the arguments returned by the function.
    Custom(Arc<dyn Fn(&A) -> A + Send + Sync>),
}

impl<A> Clone for Symmetry<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Off => Self::Off,
            Self::Reversed => Self::Reversed,
            Self::Custom(mirror) => Self::Custom(mirror.clone()),
        }
    }
}

type KeyArgsFn<A> = dyn Fn(&A) -> Vec<String> + Send + Sync;
type ComputeFn<A, V> = dyn Fn(&A) -> Result<V, CacheError> + Send + Sync;
type ReverseFn<A> = dyn Fn(&dyn Any) -> Option<A> + Send + Sync;

struct Reverser<A> {
    type_name: String,
    reverse: Arc<ReverseFn<A>>,
}

struct MemoInner<A, V> {
    template: KeyTemplate,
    key_args: Box<KeyArgsFn<A>>,
    compute: Box<ComputeFn<A, V>>,
    symmetry: Symmetry<A>,
    ttl: Option<Duration>,
    machine: Arc<CacheMachine>,
    reversers: Vec<Reverser<A>>,
}

/// A cached computation over arguments `A` producing `V`.
pub struct Memoized<A, V> {
    inner: Arc<MemoInner<A, V>>,
}

impl<A, V> Clone for Memoized<A, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, V> Memoized<A, V>
where
    A: MemoArgs,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start describing a memoized computation.
    ///
    /// `key_args` maps call arguments to the template's substitution values
    /// and must be deterministic.
    pub fn builder<K, F>(template: impl Into<String>, key_args: K, compute: F) -> MemoBuilder<A, V>
    where
        K: Fn(&A) -> Vec<String> + Send + Sync + 'static,
        F: Fn(&A) -> Result<V, CacheError> + Send + Sync + 'static,
    {
        MemoBuilder {
            template: KeyTemplate::new(template),
            key_args: Box::new(key_args),
            compute: Box::new(compute),
            symmetry: Symmetry::Off,
            ttl: None,
            watches: Vec::new(),
        }
    }

    pub fn template(&self) -> &KeyTemplate {
        &self.inner.template
    }

    pub fn key(&self, args: &A) -> CacheKey {
        self.inner.template.render(&(self.inner.key_args)(args))
    }

    /// Cached value for `args`, computing and storing it on a miss.
    pub fn call(&self, args: &A) -> Result<V, CacheError> {
        let key = self.key(args);
        if let Some(value) = self.inner.machine.get::<V>(&key, None) {
            return Ok(value);
        }
        let value = self.bypass(args)?;
        self.inner.machine.set(&key, &value, self.inner.ttl);
        Ok(value)
    }

    /// Run the computation without touching the cache.
    pub fn bypass(&self, args: &A) -> Result<V, CacheError> {
        let started = Instant::now();
        let result = (self.inner.compute)(args);
        histogram!(
            METRIC_MEMO_COMPUTE_MS,
            "template" => self.inner.template.as_str().to_string()
        )
        .record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Recompute the value for `args` and overwrite its cache entry.
    pub fn invalidate(&self, args: &A) -> Result<(), CacheError> {
        let key = self.key(args);
        info!(key = %key, "Invalidating memoized value");
        let value = self.bypass(args)?;
        self.inner.machine.set(&key, &value, self.inner.ttl);
        Ok(())
    }

    /// Invalidate `args` and, when symmetric, the mirrored arguments too.
    pub fn invalidate_symmetric(&self, args: &A) -> Result<(), CacheError> {
        self.invalidate(args)?;
        match &self.inner.symmetry {
            Symmetry::Off => Ok(()),
            Symmetry::Reversed => self.invalidate(&args.reversed()),
            Symmetry::Custom(mirror) => self.invalidate(&mirror(args)),
        }
    }

    /// Map a watched instance to call arguments and invalidate them.
    ///
    /// Returns `false` when no watch accepts instances of type `W`.
    pub fn invalidate_with_reverse<W: Any>(&self, instance: &W) -> Result<bool, CacheError> {
        let instance: &dyn Any = instance;
        match self.reverse(instance) {
            Some(args) => self.invalidate_symmetric(&args).map(|()| true),
            None => Ok(false),
        }
    }

    fn reverse(&self, instance: &dyn Any) -> Option<A> {
        self.inner
            .reversers
            .iter()
            .find_map(|reverser| (reverser.reverse)(instance))
    }

    fn on_event(&self, event: &LifecycleEvent, reverse: &ReverseFn<A>) {
        if event.raw {
            debug!(
                template = %self.inner.template,
                event_id = %event.id,
                entity_type = event.entity_type,
                "Ignoring raw lifecycle event"
            );
            return;
        }
        info!(
            template = %self.inner.template,
            event_id = %event.id,
            event_kind = event.kind.as_str(),
            entity_type = event.entity_type,
            "Invalidating memoized value on lifecycle event"
        );
        let instance: &dyn Any = event.instance_any();
        let Some(args) = reverse(instance) else {
            warn!(
                template = %self.inner.template,
                entity_type = event.entity_type,
                "Watched instance has an unexpected type"
            );
            return;
        };
        if let Err(err) = self.invalidate_symmetric(&args) {
            error!(
                template = %self.inner.template,
                event_id = %event.id,
                error = %err,
                "Memoized value recompute failed"
            );
        }
    }
}

struct WatchSpec<A> {
    type_name: String,
    typed: bool,
    reverse: Arc<ReverseFn<A>>,
}

/// Configuration for a [`Memoized`] computation.
pub struct MemoBuilder<A, V> {
    template: KeyTemplate,
    key_args: Box<KeyArgsFn<A>>,
    compute: Box<ComputeFn<A, V>>,
    symmetry: Symmetry<A>,
    ttl: Option<Duration>,
    watches: Vec<WatchSpec<A>>,
}

impl<A, V> MemoBuilder<A, V>
where
    A: MemoArgs,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Invalidate on lifecycle events of `W`; `reverse` maps the changed
    /// instance to the call arguments to refresh.
    pub fn watch<W, R>(mut self, reverse: R) -> Self
    where
        W: Record,
        R: Fn(&W) -> A + Send + Sync + 'static,
    {
        self.watches.push(WatchSpec {
            type_name: W::TYPE_NAME.to_string(),
            typed: true,
            reverse: downcasting(reverse),
        });
        self
    }

    /// Like [`watch`](Self::watch), but binds only once a type named
    /// `type_name` is defined in the registry.
    pub fn watch_named<W, R>(mut self, type_name: impl Into<String>, reverse: R) -> Self
    where
        W: Any,
        R: Fn(&W) -> A + Send + Sync + 'static,
    {
        self.watches.push(WatchSpec {
            type_name: type_name.into(),
            typed: false,
            reverse: downcasting(reverse),
        });
        self
    }

    /// Refresh the reversed arguments as well.
    pub fn symmetrical(mut self) -> Self {
        self.symmetry = Symmetry::Reversed;
        self
    }

    /// Refresh the arguments produced by `mirror` as well.
    pub fn symmetrical_with<M>(mut self, mirror: M) -> Self
    where
        M: Fn(&A) -> A + Send + Sync + 'static,
    {
        self.symmetry = Symmetry::Custom(Arc::new(mirror));
        self
    }

    /// Backend TTL for stored values.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Finish the computation and subscribe its watches.
    pub fn build(self, machine: Arc<CacheMachine>, registry: &CacheRegistry) -> Memoized<A, V> {
        let MemoBuilder {
            template,
            key_args,
            compute,
            symmetry,
            ttl,
            watches,
        } = self;

        let reversers = watches
            .iter()
            .map(|watch| Reverser {
                type_name: watch.type_name.clone(),
                reverse: watch.reverse.clone(),
            })
            .collect();
        let memo = Memoized {
            inner: Arc::new(MemoInner {
                template,
                key_args,
                compute,
                symmetry,
                ttl,
                machine,
                reversers,
            }),
        };

        if watches.is_empty() {
            warn!(
                template = %memo.inner.template,
                "Memoized value has no watched type; it refreshes only on expiry"
            );
        }

        let label = format!("memo:{}", memo.inner.template);
        for watch in watches {
            if watch.typed {
                registry.define_type(&watch.type_name);
            }
            let handler = memo.clone();
            let reverse = watch.reverse;
            registry.watch(&watch.type_name, label.clone(), move |event| {
                handler.on_event(event, reverse.as_ref());
            });
        }
        memo
    }
}

impl<A, V> Memoized<A, V> {
    /// Names of the watched types.
    pub fn watched_types(&self) -> Vec<&str> {
        self.inner
            .reversers
            .iter()
            .map(|reverser| reverser.type_name.as_str())
            .collect()
    }
}

fn downcasting<W, A, R>(reverse: R) -> Arc<ReverseFn<A>>
where
    W: Any,
    R: Fn(&W) -> A + Send + Sync + 'static,
{
    Arc::new(move |instance: &dyn Any| instance.downcast_ref::<W>().map(&reverse))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::cache::config::CacheConfig;
    use crate::cache::events::EventKind;
    use crate::store::EntityId;

    #[derive(Debug, Clone)]
    struct Like {
        id: Option<EntityId>,
        from: EntityId,
        to: EntityId,
    }

    impl Record for Like {
        const TYPE_NAME: &'static str = "social.Like";

        fn id(&self) -> Option<EntityId> {
            self.id
        }

        fn assign_id(&mut self, id: EntityId) {
            self.id = Some(id);
        }
    }

    fn machine() -> Arc<CacheMachine> {
        Arc::new(CacheMachine::new(
            Arc::new(MemoryBackend::new()),
            CacheConfig::default(),
        ))
    }

    fn pair_key(args: &(EntityId, EntityId)) -> Vec<String> {
        vec![args.0.to_string(), args.1.to_string()]
    }

    /// A computation whose result is the number of times it has run.
    fn counting(
        runs: &Arc<AtomicUsize>,
    ) -> impl Fn(&(EntityId, EntityId)) -> Result<usize, CacheError> + Send + Sync + 'static {
        let runs = runs.clone();
        move |_| Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
    }

    #[test]
    fn args_reverse() {
        assert_eq!((1, 2).reversed(), (2, 1));
        assert_eq!((1, 2, 3).reversed(), (3, 2, 1));
        assert_eq!((7,).reversed(), (7,));
        assert_eq!(vec![1, 2, 3].reversed(), vec![3, 2, 1]);
    }

    #[test]
    fn call_caches_until_invalidated() {
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memoized::builder("pair::{}-{}", pair_key, counting(&runs))
            .build(machine(), &CacheRegistry::new());

        assert_eq!(memo.key(&(1, 2)).as_str(), "pair::1-2");
        assert_eq!(memo.call(&(1, 2)).expect("call"), 1);
        assert_eq!(memo.call(&(1, 2)).expect("call"), 1);

        memo.invalidate(&(1, 2)).expect("invalidate");
        assert_eq!(memo.call(&(1, 2)).expect("call"), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bypass_never_touches_cache() {
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memoized::builder("pair::{}-{}", pair_key, counting(&runs))
            .build(machine(), &CacheRegistry::new());

        assert_eq!(memo.bypass(&(1, 2)).expect("bypass"), 1);
        assert_eq!(memo.call(&(1, 2)).expect("call"), 2);
        assert_eq!(memo.bypass(&(1, 2)).expect("bypass"), 3);
        assert_eq!(memo.call(&(1, 2)).expect("call"), 2);
    }

    #[test]
    fn compute_errors_are_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let memo = Memoized::builder(
            "flaky::{}",
            |args: &(EntityId,)| vec![args.0.to_string()],
            move |_: &(EntityId,)| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CacheError::misuse("not yet"))
                } else {
                    Ok(5_u32)
                }
            },
        )
        .build(machine(), &CacheRegistry::new());

        assert!(memo.call(&(1,)).is_err());
        assert_eq!(memo.call(&(1,)).expect("retry"), 5);
    }

    #[test]
    fn symmetric_invalidation_refreshes_both_orders() {
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memoized::builder("pair::{}-{}", pair_key, counting(&runs))
            .symmetrical()
            .build(machine(), &CacheRegistry::new());
        let forward = memo.call(&(1, 2)).expect("forward");
        let backward = memo.call(&(2, 1)).expect("backward");

        memo.invalidate_symmetric(&(1, 2)).expect("invalidate");

        assert_ne!(memo.call(&(1, 2)).expect("forward"), forward);
        assert_ne!(memo.call(&(2, 1)).expect("backward"), backward);
    }

    #[test]
    fn custom_symmetry_uses_mirror() {
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memoized::builder("pair::{}-{}", pair_key, counting(&runs))
            .symmetrical_with(|&(a, b)| (b + 10, a + 10))
            .build(machine(), &CacheRegistry::new());
        let mirrored = memo.call(&(12, 11)).expect("mirrored");
        let reversed = memo.call(&(2, 1)).expect("reversed");

        memo.invalidate_symmetric(&(1, 2)).expect("invalidate");

        assert_ne!(memo.call(&(12, 11)).expect("mirrored"), mirrored);
        assert_eq!(memo.call(&(2, 1)).expect("reversed"), reversed);
    }

    #[test]
    fn watched_events_refresh_through_reverse_mapping() {
        let registry = CacheRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memoized::builder("pair::{}-{}", pair_key, counting(&runs))
            .watch(|like: &Like| (like.from, like.to))
            .build(machine(), &registry);
        assert_eq!(memo.call(&(1, 2)).expect("call"), 1);
        assert_eq!(memo.watched_types(), vec!["social.Like"]);

        let like = Like {
            id: Some(1),
            from: 1,
            to: 2,
        };
        registry.publish(EventKind::Created, &like, false);
        assert_eq!(memo.call(&(1, 2)).expect("after create"), 2);

        registry.publish(EventKind::Deleted, &like, false);
        assert_eq!(memo.call(&(1, 2)).expect("after delete"), 3);
    }

    #[test]
    fn raw_events_are_ignored() {
        let registry = CacheRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memoized::builder("pair::{}-{}", pair_key, counting(&runs))
            .watch(|like: &Like| (like.from, like.to))
            .build(machine(), &registry);
        memo.call(&(1, 2)).expect("call");

        let like = Like {
            id: Some(1),
            from: 1,
            to: 2,
        };
        registry.publish(EventKind::Created, &like, true);

        assert_eq!(memo.call(&(1, 2)).expect("call"), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn named_watch_binds_when_type_is_defined() {
        let registry = CacheRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memoized::builder("pair::{}-{}", pair_key, counting(&runs))
            .watch_named("Social.Like", |like: &Like| (like.from, like.to))
            .build(machine(), &registry);
        assert_eq!(registry.pending_count("social.like"), 1);

        registry.define_type(Like::TYPE_NAME);
        memo.call(&(1, 2)).expect("call");
        registry.publish(
            EventKind::Updated,
            &Like {
                id: Some(1),
                from: 1,
                to: 2,
            },
            false,
        );

        assert_eq!(memo.call(&(1, 2)).expect("call"), 2);
    }

    #[test]
    fn invalidate_with_reverse_accepts_only_watched_types() {
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memoized::builder("pair::{}-{}", pair_key, counting(&runs))
            .watch(|like: &Like| (like.from, like.to))
            .build(machine(), &CacheRegistry::new());

        let like = Like {
            id: None,
            from: 3,
            to: 4,
        };
        assert!(memo.invalidate_with_reverse(&like).expect("like"));
        assert!(!memo.invalidate_with_reverse(&"unrelated").expect("str"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unwatched_memo_still_caches() {
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memoized::builder("pair::{}-{}", pair_key, counting(&runs))
            .ttl(Duration::from_secs(60))
            .build(machine(), &CacheRegistry::new());

        assert!(memo.watched_types().is_empty());
        memo.call(&(1, 1)).expect("call");
        memo.call(&(1, 1)).expect("call");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

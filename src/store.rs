//! Persistent store collaborator.
//!
//! The cache engine only needs a single-result query that reports a
//! distinguishable "not found", plus save and delete. [`MemoryStore`] is an
//! in-process implementation used by the demo and the tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;

use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "store";

/// Stable identifier assigned by the store.
pub type EntityId = u64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity `{entity}` not found")]
    NotFound { entity: &'static str },
    #[error("query for `{entity}` matched {count} rows")]
    MultipleMatches { entity: &'static str, count: usize },
    #[error("store failure: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// A record the store knows how to persist and filter.
pub trait Record: Clone + fmt::Debug + Send + Sync + 'static {
    /// Type-qualified name, e.g. `followers.Account`.
    const TYPE_NAME: &'static str;

    fn id(&self) -> Option<EntityId>;

    fn assign_id(&mut self, id: EntityId);

    /// String form of a non-identifier field, used for equality filters.
    fn field(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Equality filter: one or more `(field, value)` terms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Filter {
    terms: Vec<(String, String)>,
}

impl Filter {
    pub fn by(field: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::default().and(field, value)
    }

    pub fn id(id: EntityId) -> Self {
        Self::by("id", id)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl fmt::Display) -> Self {
        self.terms.push((field.into(), value.to_string()));
        self
    }

    pub fn terms(&self) -> &[(String, String)] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// The only term, if there is exactly one.
    pub fn single(&self) -> Option<(&str, &str)> {
        match self.terms.as_slice() {
            [(field, value)] => Some((field.as_str(), value.as_str())),
            _ => None,
        }
    }

    fn matches<E: Record>(&self, record: &E) -> bool {
        self.terms.iter().all(|(field, value)| {
            let field = field.strip_suffix("__exact").unwrap_or(field);
            match field {
                "id" | "pk" => {
                    record.id().map(|id| id.to_string()).as_deref() == Some(value.as_str())
                }
                other => record.field(other).as_deref() == Some(value.as_str()),
            }
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (field, value)) in self.terms.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}={value}")?;
        }
        Ok(())
    }
}

/// Per-type store access.
pub trait EntityStore<E: Record>: Send + Sync {
    /// Single result matching every term of `filter`.
    fn get(&self, filter: &Filter) -> Result<E, StoreError>;

    /// Persist `entity`, assigning an identifier when it has none.
    /// Returns `true` when a new row was created.
    fn save(&self, entity: &mut E) -> Result<bool, StoreError>;

    fn delete(&self, entity: &E) -> Result<(), StoreError>;
}

/// In-memory store keyed by identifier.
pub struct MemoryStore<E> {
    rows: RwLock<BTreeMap<EntityId, E>>,
    next_id: AtomicU64,
    queries: AtomicUsize,
}

impl<E: Record> MemoryStore<E> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            queries: AtomicUsize::new(0),
        }
    }

    /// Number of `get` queries served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn count_where(&self, predicate: impl Fn(&E) -> bool) -> usize {
        rw_read(&self.rows, SOURCE, "count_where")
            .values()
            .filter(|row| predicate(row))
            .count()
    }

    pub fn find_where(&self, predicate: impl Fn(&E) -> bool) -> Vec<E> {
        rw_read(&self.rows, SOURCE, "find_where")
            .values()
            .filter(|row| predicate(row))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.rows, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Record> Default for MemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Record> EntityStore<E> for MemoryStore<E> {
    fn get(&self, filter: &Filter) -> Result<E, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let rows = rw_read(&self.rows, SOURCE, "get");
        let mut matches = rows.values().filter(|row| filter.matches(*row));
        let first = matches
            .next()
            .ok_or_else(|| StoreError::not_found(E::TYPE_NAME))?;
        let extra = matches.count();
        if extra > 0 {
            return Err(StoreError::MultipleMatches {
                entity: E::TYPE_NAME,
                count: extra + 1,
            });
        }
        Ok(first.clone())
    }

    fn save(&self, entity: &mut E) -> Result<bool, StoreError> {
        let mut rows = rw_write(&self.rows, SOURCE, "save");
        let id = match entity.id() {
            Some(id) => {
                self.next_id.fetch_max(id + 1, Ordering::SeqCst);
                id
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                entity.assign_id(id);
                id
            }
        };
        let created = rows.insert(id, entity.clone()).is_none();
        Ok(created)
    }

    fn delete(&self, entity: &E) -> Result<(), StoreError> {
        let id = entity
            .id()
            .ok_or_else(|| StoreError::backend("cannot delete an unsaved entity"))?;
        rw_write(&self.rows, SOURCE, "delete")
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(E::TYPE_NAME))
    }
}

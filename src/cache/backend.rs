//! Backend cache service collaborator.
//!
//! The engine talks to a key-value service with get/set/ttl semantics that
//! may be transiently unavailable. [`MemoryBackend`] is an in-process
//! implementation that honours the protocol TTL and can be switched offline.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::backend";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cache backend unavailable: {message}")]
    Connection { message: String },
    #[error("cache backend protocol error: {message}")]
    Protocol { message: String },
}

impl BackendError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

/// Raw byte store addressed by hashed keys.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Store `value`; `ttl` of `None` keeps it until overwritten.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError>;
}

struct Slot {
    bytes: Vec<u8>,
    evict_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.evict_at.is_none_or(|at| at > now)
    }
}

/// In-memory backend.
///
/// Expired slots are dropped when read and swept on every write, so keys
/// that are soft-invalidated and never read again do not accumulate.
pub struct MemoryBackend {
    slots: RwLock<HashMap<String, Slot>>,
    online: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }

    /// Simulate an outage: while offline every call fails with a connection error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        rw_read(&self.slots, SOURCE, "len")
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.slots, SOURCE, "clear").clear();
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::connection("memory backend is offline"))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.ensure_online()?;
        let now = Instant::now();
        {
            let slots = rw_read(&self.slots, SOURCE, "get");
            match slots.get(key) {
                None => return Ok(None),
                Some(slot) if slot.is_live(now) => return Ok(Some(slot.bytes.clone())),
                Some(_) => {}
            }
        }
        let mut slots = rw_write(&self.slots, SOURCE, "get.evict");
        if slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
            slots.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BackendError> {
        self.ensure_online()?;
        let now = Instant::now();
        let slot = Slot {
            bytes: value,
            evict_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        };
        let mut slots = rw_write(&self.slots, SOURCE, "set");
        slots.retain(|_, slot| slot.is_live(now));
        slots.insert(key.to_string(), slot);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

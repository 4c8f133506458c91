pub mod cache;
pub mod config;
pub mod error;
pub mod store;
pub mod telemetry;
pub mod tweeter;

pub use error::CacheError;
pub use store::{EntityId, EntityStore, Filter, MemoryStore, Record, StoreError};

//! Offline-first caching layer.
//!
//! This module provides the durable local store and the read-through facade
//! application code uses for every read and write:
//! - Caches records per entity type as opaque JSON
//! - Serves the network when online and falls back to the local store
//! - Applies optimistic updates and queues writes the backend has not confirmed

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, WriteOutcome};
pub use storage::{LocalStore, LocalUpdate, SqliteStorage, DEFAULT_MAX_PENDING};
pub use traits::{CacheResult, CacheSource, Cacheable, CachedEntity, EntityType};

//! Persistent, versioned response caching.
//!
//! This module provides:
//! - Named generations of request-key → response entries, backed by SQLite
//! - A manager that only persists successful same-origin responses
//! - The fallback resolver that runs a policy's attempts against cache and network

mod layer;
mod storage;
mod store;
mod traits;

pub use layer::{FallbackResolver, ServeContext};
pub use storage::{CacheStorage, SqliteStorage};
pub use store::{CacheStore, Generation};
pub use traits::{
  CacheEntry, CacheResult, CacheSource, GenerationRecord, RequestKey, StoredResponse,
};

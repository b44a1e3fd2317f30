//! Named, versioned generations of stored responses.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;

use super::storage::CacheStorage;
use super::traits::{CacheEntry, GenerationRecord, RequestKey, StoredResponse};
use crate::lifecycle::LifecycleState;
use crate::net::{Request, Response};

/// Manager over all generations held by a storage backend.
#[derive(Clone)]
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
  vary_headers: Arc<[String]>,
  cache_cross_origin: bool,
}

impl CacheStore {
  pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
    Self {
      storage,
      vary_headers: Arc::from(Vec::new()),
      cache_cross_origin: false,
    }
  }

  /// Fold these request headers into every key.
  pub fn with_vary_headers(mut self, headers: &[String]) -> Self {
    self.vary_headers = Arc::from(headers.to_vec());
    self
  }

  /// Allow CORS responses to be persisted.
  pub fn with_cross_origin(mut self, enabled: bool) -> Self {
    self.cache_cross_origin = enabled;
    self
  }

  pub fn key_for(&self, request: &Request) -> RequestKey {
    RequestKey::for_request(request, &self.vary_headers)
  }

  /// Whether `response` qualifies for storage under this store's rules.
  pub fn accepts(&self, response: &Response) -> bool {
    response.is_persistable(self.cache_cross_origin)
  }

  /// Open a generation, creating it empty if it does not exist.
  pub fn open(&self, name: &str, version: &str) -> Result<Generation> {
    if !self.storage.generation_names()?.iter().any(|n| n == name) {
      let record = GenerationRecord {
        name: name.to_string(),
        version: version.to_string(),
        state: LifecycleState::Active,
        manifest: Vec::new(),
        created_at: Utc::now(),
      };
      self.storage.populate_generation(&record, &[])?;
    }
    Ok(self.handle(name))
  }

  /// Handle to a generation without creating it.
  pub fn handle(&self, name: &str) -> Generation {
    Generation {
      name: name.to_string(),
      store: self.clone(),
    }
  }

  /// Persist a fully fetched generation in one step.
  pub fn populate(&self, record: &GenerationRecord, entries: &[CacheEntry]) -> Result<()> {
    self.storage.populate_generation(record, entries)
  }

  /// Delete every generation and install `record` in their place, atomically.
  pub fn reset(&self, record: &GenerationRecord, entries: &[CacheEntry]) -> Result<()> {
    self.storage.replace_all(record, entries)
  }

  pub fn delete(&self, name: &str) -> Result<bool> {
    self.storage.delete_generation(name)
  }

  pub fn list_names(&self) -> Result<Vec<String>> {
    self.storage.generation_names()
  }

  pub fn records(&self) -> Result<Vec<GenerationRecord>> {
    self.storage.generations()
  }

  pub fn set_state(&self, name: &str, state: LifecycleState) -> Result<()> {
    self.storage.set_state(name, state)
  }

  /// Build a storable entry, or None if the response must pass through unstored.
  pub fn entry_for(&self, key: RequestKey, response: &Response) -> Option<CacheEntry> {
    self.accepts(response).then(|| CacheEntry {
      key,
      response: StoredResponse::capture(response),
    })
  }
}

/// A single named generation.
#[derive(Clone)]
pub struct Generation {
  name: String,
  store: CacheStore,
}

impl Generation {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Look up the stored response for a key.
  pub fn lookup(&self, key: &RequestKey) -> Result<Option<StoredResponse>> {
    self.store.storage.get_entry(&self.name, key)
  }

  pub fn contains(&self, key: &RequestKey) -> Result<bool> {
    self.store.storage.contains(&self.name, key)
  }

  /// Store a copy of `response` under `key`.
  ///
  /// The caller keeps ownership of the original. Returns false when the
  /// response is not persistable or the generation has been deleted.
  pub fn put(&self, key: &RequestKey, response: &Response) -> Result<bool> {
    match self.store.entry_for(key.clone(), response) {
      Some(entry) => self.store.storage.put_entry(&self.name, &entry),
      None => Ok(false),
    }
  }

  pub fn urls(&self) -> Result<Vec<String>> {
    self.store.storage.entry_urls(&self.name)
  }
}

//! Fallback resolver that orchestrates cache lookups with network fetching.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use super::store::{CacheStore, Generation};
use super::traits::{CacheResult, RequestKey};
use crate::net::{FetchError, Network, Request, Response};
use crate::strategy::Policy;

/// Everything a policy needs to answer one intercepted request.
#[derive(Clone)]
pub struct ServeContext {
  pub request: Request,
  pub key: RequestKey,
  /// Generation serving reads, if one is active
  pub generation: Option<Generation>,
}

/// Runs a policy as an ordered sequence of attempts.
///
/// This sits between the interception layer and the network, providing
/// the cache, network and synthetic steps each policy is built from. Every
/// path ends in a concrete response.
pub struct FallbackResolver {
  store: CacheStore,
  network: Arc<dyn Network>,
  /// Upper bound on any single network attempt
  timeout: Option<Duration>,
  offline_document: Option<Url>,
  revalidations: Arc<Mutex<JoinSet<()>>>,
}

impl FallbackResolver {
  /// Create a resolver over the given store and network.
  pub fn new(store: CacheStore, network: Arc<dyn Network>) -> Self {
    Self {
      store,
      network,
      timeout: Some(Duration::from_secs(10)),
      offline_document: None,
      revalidations: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  /// Set the network timeout; `None` lets a hung network stall the attempt.
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  /// Set the page served when a navigation cannot be answered otherwise.
  pub fn with_offline_document(mut self, url: Option<Url>) -> Self {
    self.offline_document = url;
    self
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Execute `policy` for the request in `ctx`.
  pub async fn resolve(&self, policy: Policy, ctx: &ServeContext) -> CacheResult<Response> {
    policy.strategy().execute(self, ctx).await
  }

  /// One network attempt, raced against the configured timeout.
  pub async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    match self.timeout {
      Some(limit) => tokio::time::timeout(limit, self.network.fetch(request))
        .await
        .map_err(|_| FetchError::Timeout(limit))?,
      None => self.network.fetch(request).await,
    }
  }

  /// Look the request up in the serving generation. Read failures count as a miss.
  pub fn cached(&self, ctx: &ServeContext) -> Option<CacheResult<Response>> {
    let generation = ctx.generation.as_ref()?;
    match generation.lookup(&ctx.key) {
      Ok(Some(stored)) => Some(CacheResult::from_cache(
        stored.to_response(),
        stored.stored_at,
      )),
      Ok(None) => None,
      Err(e) => {
        warn!(
          url = %ctx.key.url(),
          generation = generation.name(),
          error = %e,
          "cache read failed"
        );
        None
      }
    }
  }

  /// Persist a copy of a network response. Failures are logged and ignored.
  pub fn write_back(&self, ctx: &ServeContext, response: &Response) {
    let Some(generation) = ctx.generation.as_ref() else {
      return;
    };
    match generation.put(&ctx.key, response) {
      Ok(true) => debug!(url = %ctx.key.url(), generation = generation.name(), "stored"),
      Ok(false) => debug!(url = %ctx.key.url(), status = response.status(), "not stored"),
      Err(e) => {
        warn!(
          url = %ctx.key.url(),
          generation = generation.name(),
          error = %e,
          "cache write failed"
        )
      }
    }
  }

  /// Terminal step once cache and network are both exhausted.
  ///
  /// Navigations get the offline document when it is stored; everything
  /// else, and navigations without one, get a synthetic 503.
  pub fn exhausted(&self, ctx: &ServeContext, error: &FetchError) -> CacheResult<Response> {
    if ctx.request.is_navigation() {
      if let Some(offline) = self.offline_document(ctx) {
        debug!(url = %ctx.key.url(), "serving offline document");
        return offline;
      }
    }

    debug!(url = %ctx.key.url(), error = %error, "all attempts failed");
    CacheResult::synthetic(Response::service_unavailable(&format!(
      "Service unavailable: {}",
      error
    )))
  }

  fn offline_document(&self, ctx: &ServeContext) -> Option<CacheResult<Response>> {
    let url = self.offline_document.as_ref()?;
    let generation = ctx.generation.as_ref()?;
    let key = self.store.key_for(&Request::get(url.clone()));

    match generation.lookup(&key) {
      Ok(Some(stored)) => Some(CacheResult::offline(stored.to_response(), stored.stored_at)),
      Ok(None) => None,
      Err(e) => {
        warn!(url = %url, error = %e, "offline document read failed");
        None
      }
    }
  }

  /// Refresh the stored entry off the request path.
  ///
  /// The outcome never reaches the response already returned; errors are dropped.
  pub fn revalidate_in_background(&self, ctx: &ServeContext) {
    let resolver = self.clone();
    let ctx = ctx.clone();

    let mut tasks = match self.revalidations.lock() {
      Ok(tasks) => tasks,
      Err(e) => {
        warn!(error = %e, "revalidation set poisoned, skipping refresh");
        return;
      }
    };

    // Reap finished refreshes so the set does not grow without bound
    while tasks.try_join_next().is_some() {}

    tasks.spawn(async move {
      match resolver.fetch(&ctx.request).await {
        Ok(response) => resolver.write_back(&ctx, &response),
        Err(e) => debug!(url = %ctx.key.url(), error = %e, "background revalidation failed"),
      }
    });
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) {
    let mut pending = match self.revalidations.lock() {
      Ok(mut tasks) => std::mem::take(&mut *tasks),
      Err(_) => return,
    };
    while pending.join_next().await.is_some() {}
  }
}

impl Clone for FallbackResolver {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      network: Arc::clone(&self.network),
      timeout: self.timeout,
      offline_document: self.offline_document.clone(),
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}

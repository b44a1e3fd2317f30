//! The interception layer: lifecycle state machine plus the serve path.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CacheEntry, CacheResult, CacheStorage, CacheStore, FallbackResolver,
  GenerationRecord, ServeContext,
};
use crate::config::Config;
use crate::control::{self, ControlMessage, ControlReply};
use crate::event::{Event, Outcome};
use crate::lifecycle::{LifecycleNotice, LifecycleState, Registration, Release};
use crate::net::{resolve_url, Network, Request, Response};
use crate::strategy::{Policy, StrategySelector};

/// Outcome of populating a generation from a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub generation: String,
  pub version: String,
  /// URLs stored
  pub stored: Vec<String>,
  /// Manifest entries that could not be fetched or stored
  pub failed: Vec<String>,
  /// Lifecycle state the release ended in
  pub state: LifecycleState,
}

/// Intercepts every outgoing request of the pages in a scope.
///
/// Serving, installing and activating may run concurrently; install,
/// activate and clear are serialized among themselves.
pub struct InterceptionLayer {
  config: Config,
  store: CacheStore,
  selector: StrategySelector,
  resolver: FallbackResolver,
  registration: Mutex<Registration>,
  lifecycle: tokio::sync::Mutex<()>,
  notices: broadcast::Sender<LifecycleNotice>,
}

impl InterceptionLayer {
  /// Create the layer for `config`, restoring any persisted registration.
  pub fn new(
    config: Config,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let store = CacheStore::new(storage)
      .with_vary_headers(&config.vary_headers)
      .with_cross_origin(config.cache_cross_origin);

    let selector = StrategySelector::new(&config.scope)
      .with_backend(config.backend.clone())
      .with_network_only(config.network_only.clone())
      .with_cacheable_methods(&config.cacheable_methods)
      .with_cross_origin(config.cache_cross_origin);

    let resolver = FallbackResolver::new(store.clone(), network)
      .with_timeout(config.network_timeout())
      .with_offline_document(config.offline_document_url()?);

    let registration = Self::restore_registration(&store)?;
    let (notices, _) = broadcast::channel(64);

    Ok(Self {
      config,
      store,
      selector,
      resolver,
      registration: Mutex::new(registration),
      lifecycle: tokio::sync::Mutex::new(()),
      notices,
    })
  }

  fn restore_registration(store: &CacheStore) -> Result<Registration> {
    let mut active = None;
    let mut waiting = None;
    for record in store.records()? {
      let release = Release::new(record.version, record.manifest);
      match record.state {
        LifecycleState::Active => active = Some(release),
        LifecycleState::Waiting => waiting = Some(release),
        _ => {}
      }
    }
    Ok(Registration::restore(active, waiting))
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Subscribe to lifecycle notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<LifecycleNotice> {
    self.notices.subscribe()
  }

  /// Snapshot of the registration.
  pub fn registration(&self) -> Registration {
    self.lock_registration().clone()
  }

  fn lock_registration(&self) -> MutexGuard<'_, Registration> {
    // Registration updates are single assignments, so a poisoned lock still holds consistent data
    self
      .registration
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn notify(&self, notice: LifecycleNotice) {
    // No subscribers is fine
    let _ = self.notices.send(notice);
  }

  fn notify_state(&self, version: &str, state: LifecycleState) {
    info!(version, state = %state, "lifecycle transition");
    self.notify(LifecycleNotice::StateChange {
      version: version.to_string(),
      state,
    });
  }

  /// Single entry point for every event kind.
  pub async fn handle(&self, event: Event) -> Outcome {
    match event {
      Event::Install(release) => match self.install(&release).await {
        Ok(report) => Outcome::Installed(report),
        Err(e) => Outcome::Failed(e.to_string()),
      },
      Event::Activate => match self.activate().await {
        Ok(generation) => Outcome::Activated(generation),
        Err(e) => Outcome::Failed(e.to_string()),
      },
      Event::Fetch(request) => Outcome::Response(self.serve(request).await),
      Event::Message(message) => Outcome::Reply(self.handle_control(message).await),
    }
  }

  /// Dispatch a control message.
  pub async fn handle_control(&self, message: ControlMessage) -> ControlReply {
    control::dispatch(self, message).await
  }

  // ------------------------------------------------------------------------
  // Serving
  // ------------------------------------------------------------------------

  /// Answer one intercepted request. Always produces a response.
  pub async fn serve(&self, request: Request) -> Response {
    self.serve_traced(request).await.data
  }

  /// Like [`serve`](Self::serve), also reporting the policy and source.
  pub async fn serve_traced(&self, request: Request) -> CacheResult<Response> {
    let generation = self
      .lock_registration()
      .active()
      .map(|release| self.store.handle(&self.config.generation_name(&release.version)));

    let key = self.store.key_for(&request);
    let policy = self.selector.classify(&request, || {
      generation
        .as_ref()
        .is_some_and(|g| g.contains(&key).unwrap_or(false))
    });

    // Bypassed requests never see a generation
    let generation = if policy == Policy::Bypass {
      None
    } else {
      generation
    };

    let ctx = ServeContext {
      request,
      key,
      generation,
    };
    let result = self.resolver.resolve(policy, &ctx).await;

    debug!(
      url = %ctx.request.url(),
      method = ctx.request.method(),
      policy = %policy,
      source = %result.source,
      status = result.data.status(),
      "served"
    );
    result
  }

  /// Wait for background revalidations to finish.
  pub async fn settle(&self) {
    self.resolver.settle().await;
  }

  // ------------------------------------------------------------------------
  // Lifecycle
  // ------------------------------------------------------------------------

  /// Install a release: precache its manifest into a new generation.
  ///
  /// Unreachable resources are logged and skipped; the generation is still
  /// created. The release then waits, unless nothing needs to wait for.
  pub async fn install(&self, release: &Release) -> Result<InstallReport> {
    let _guard = self.lifecycle.lock().await;
    let name = self.config.generation_name(&release.version);

    let refreshing_active = self
      .lock_registration()
      .active()
      .is_some_and(|active| active.version == release.version);

    if !refreshing_active {
      self.lock_registration().begin_install(release.clone());
      self.notify(LifecycleNotice::UpdateFound {
        version: release.version.clone(),
      });
      self.notify_state(&release.version, LifecycleState::Installing);
    }

    info!(generation = %name, resources = release.manifest.len(), "installing");
    let (entries, failed) = self.fetch_all(&release.manifest).await;
    for url in &failed {
      warn!(generation = %name, url = %url, "precache resource unavailable");
    }

    let state = if refreshing_active {
      LifecycleState::Active
    } else {
      LifecycleState::Waiting
    };
    let record = GenerationRecord {
      name: name.clone(),
      version: release.version.clone(),
      state,
      manifest: release.manifest.clone(),
      created_at: Utc::now(),
    };

    if let Err(e) = self.store.populate(&record, &entries) {
      if !refreshing_active {
        self.lock_registration().abort_install();
        self.notify_state(&release.version, LifecycleState::Redundant);
      }
      return Err(eyre!("Failed to install {}: {}", name, e));
    }

    let stored = entries.iter().map(|e| e.key.url().to_string()).collect();
    if refreshing_active {
      info!(generation = %name, "refreshed active generation");
      return Ok(InstallReport {
        generation: name,
        version: release.version.clone(),
        stored,
        failed,
        state,
      });
    }

    let displaced = self.lock_registration().finish_install();
    if let Some(old) = displaced {
      self.retire(&old.version);
    }
    self.notify_state(&release.version, LifecycleState::Waiting);

    let promote = {
      let registration = self.lock_registration();
      registration.active().is_none()
        || registration.clients() == 0
        || self.config.skip_waiting_on_install
    };

    let state = if promote {
      self.activate_locked()?;
      LifecycleState::Active
    } else {
      let clients = self.lock_registration().clients();
      info!(generation = %name, clients, "waiting for open pages");
      LifecycleState::Waiting
    };

    Ok(InstallReport {
      generation: name,
      version: release.version.clone(),
      stored,
      failed,
      state,
    })
  }

  /// Promote the waiting release and delete every other generation.
  ///
  /// Returns the name of the newly active generation, or None if nothing was waiting.
  pub async fn activate(&self) -> Result<Option<String>> {
    let _guard = self.lifecycle.lock().await;
    self.activate_locked()
  }

  /// Force a waiting release to activate regardless of open pages.
  pub async fn skip_waiting(&self) -> Result<Option<String>> {
    self.activate().await
  }

  fn activate_locked(&self) -> Result<Option<String>> {
    let Some(next) = self.lock_registration().waiting().cloned() else {
      debug!("activate: nothing waiting");
      return Ok(None);
    };

    let name = self.config.generation_name(&next.version);
    self.notify_state(&next.version, LifecycleState::Activating);
    self.store.set_state(&name, LifecycleState::Activating)?;
    self.store.set_state(&name, LifecycleState::Active)?;

    // Serves switch to the new generation before the old ones disappear
    let previous = self
      .lock_registration()
      .promote()
      .and_then(|(_, previous)| previous);

    for other in self.store.list_names()? {
      if other != name {
        info!(generation = %other, "deleting old generation");
        let purged = self
          .store
          .set_state(&other, LifecycleState::Redundant)
          .and_then(|_| self.store.delete(&other));
        if let Err(e) = purged {
          warn!(generation = %other, error = %e, "failed to delete old generation");
        }
      }
    }

    if let Some(old) = previous.filter(|old| old.version != next.version) {
      self.notify_state(&old.version, LifecycleState::Redundant);
    }
    self.notify_state(&next.version, LifecycleState::Active);
    // Open pages adopt the new generation without reload
    self.notify(LifecycleNotice::ControllerChange {
      version: next.version.clone(),
    });

    Ok(Some(name))
  }

  fn retire(&self, version: &str) {
    let name = self.config.generation_name(version);
    if let Err(e) = self.store.delete(&name) {
      warn!(generation = %name, error = %e, "failed to delete displaced generation");
    }
    self.notify_state(version, LifecycleState::Redundant);
  }

  /// A page in scope opened.
  pub fn client_opened(&self) {
    self.lock_registration().attach_client();
  }

  /// A page in scope closed. When the last one goes, a waiting release activates.
  pub async fn client_closed(&self) -> Result<Option<String>> {
    let remaining = self.lock_registration().detach_client();
    if remaining == 0 && self.lock_registration().waiting().is_some() {
      return self.activate().await;
    }
    Ok(None)
  }

  // ------------------------------------------------------------------------
  // Runtime cache management
  // ------------------------------------------------------------------------

  /// Fetch and store URLs into the active generation without a version bump.
  ///
  /// Returns (stored, failed) URL lists.
  pub async fn cache_urls(&self, urls: &[String]) -> Result<(Vec<String>, Vec<String>)> {
    let generation = self
      .lock_registration()
      .active()
      .map(|release| self.config.generation_name(&release.version))
      .ok_or_else(|| eyre!("No active generation to add URLs to"))?;

    let (entries, mut failed) = self.fetch_all(urls).await;
    let generation = self.store.handle(&generation);

    let mut stored = Vec::new();
    for entry in entries {
      let url = entry.key.url().to_string();
      let response = entry.response.to_response();
      match generation.put(&entry.key, &response) {
        Ok(true) => stored.push(url),
        Ok(false) => failed.push(url),
        Err(e) => {
          warn!(url = %url, error = %e, "cache write failed");
          failed.push(url);
        }
      }
    }

    info!(
      generation = generation.name(),
      stored = stored.len(),
      failed = failed.len(),
      "cached urls"
    );
    Ok((stored, failed))
  }

  /// Delete all generations and repopulate the active one from its manifest.
  ///
  /// The swap is a single storage transaction, so concurrent serves see
  /// either the old generation or the repopulated one.
  pub async fn clear_cache(&self) -> Result<Option<String>> {
    let _guard = self.lifecycle.lock().await;

    let active = self.lock_registration().active().cloned();
    let Some(active) = active else {
      for name in self.store.list_names()? {
        self.store.delete(&name)?;
      }
      self.lock_registration().clear_pending();
      info!("cleared all generations");
      return Ok(None);
    };

    let name = self.config.generation_name(&active.version);
    let (entries, failed) = self.fetch_all(&active.manifest).await;
    for url in &failed {
      warn!(generation = %name, url = %url, "precache resource unavailable");
    }

    let record = GenerationRecord {
      name: name.clone(),
      version: active.version.clone(),
      state: LifecycleState::Active,
      manifest: active.manifest.clone(),
      created_at: Utc::now(),
    };
    self.store.reset(&record, &entries)?;

    let dropped = self.lock_registration().waiting().cloned();
    self.lock_registration().clear_pending();
    if let Some(waiting) = dropped {
      self.notify_state(&waiting.version, LifecycleState::Redundant);
    }

    info!(generation = %name, entries = entries.len(), "cleared and repopulated");
    Ok(Some(name))
  }

  /// Fetch URLs concurrently, returning storable entries and the URLs that failed.
  async fn fetch_all(&self, urls: &[String]) -> (Vec<CacheEntry>, Vec<String>) {
    let scope = &self.config.scope;
    let results: Vec<(String, Option<CacheEntry>)> = stream::iter(urls.iter().cloned())
      .map(|raw| async move {
        let entry = self.fetch_entry(scope, &raw).await;
        (raw, entry)
      })
      .buffered(self.config.precache_concurrency)
      .collect()
      .await;

    let mut entries = Vec::new();
    let mut failed = Vec::new();
    for (raw, entry) in results {
      match entry {
        Some(entry) => entries.push(entry),
        None => failed.push(raw),
      }
    }
    (entries, failed)
  }

  async fn fetch_entry(&self, scope: &Url, raw: &str) -> Option<CacheEntry> {
    let url = match resolve_url(scope, raw) {
      Ok(url) => url,
      Err(e) => {
        warn!(url = raw, error = %e, "invalid url");
        return None;
      }
    };

    let request = Request::get(url);
    // The store is never populated with what serving would bypass
    if self.selector.classify(&request, || false) == Policy::Bypass {
      warn!(url = %request.url(), "refusing to cache a bypassed url");
      return None;
    }

    match self.resolver.fetch(&request).await {
      Ok(response) => {
        let entry = self.store.entry_for(self.store.key_for(&request), &response);
        if entry.is_none() {
          debug!(url = %request.url(), status = response.status(), "response not storable");
        }
        entry
      }
      Err(e) => {
        debug!(url = %request.url(), error = %e, "fetch failed");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, RequestKey, SqliteStorage, StoredResponse};
  use crate::net::mock::MockNetwork;
  use crate::net::ResponseType;
  use std::time::Duration;

  const SCOPE: &str = "https://app.example/";

  fn config() -> Config {
    Config::parse(
      r#"
scope: https://app.example/
cache_name: app
version: v1
manifest: ["/", "/index.html", "/app.js"]
offline_document: /offline.html
backend:
  - host: backend.example
network_timeout_ms: 100
"#,
    )
    .unwrap()
  }

  fn url(path: &str) -> Url {
    Url::parse(SCOPE).unwrap().join(path).unwrap()
  }

  fn online_network() -> Arc<MockNetwork> {
    let network = Arc::new(MockNetwork::new());
    network
      .route(url("/").as_str(), "root v1")
      .route(url("/index.html").as_str(), "index v1")
      .route(url("/app.js").as_str(), "app v1")
      .route(url("/offline.html").as_str(), "offline page");
    network
  }

  fn layer(config: Config, network: Arc<MockNetwork>) -> InterceptionLayer {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::in_memory().unwrap());
    InterceptionLayer::new(config, storage, network).unwrap()
  }

  fn release(version: &str) -> Release {
    Release::new(version, vec!["/".into(), "/index.html".into(), "/app.js".into()])
  }

  #[tokio::test]
  async fn test_install_then_serve_offline_from_precache() {
    let network = online_network();
    let layer = layer(config(), network.clone());

    let report = layer.install(&release("v1")).await.unwrap();
    assert_eq!(report.stored.len(), 3);
    assert!(report.failed.is_empty());
    assert_eq!(report.state, LifecycleState::Active);

    network.set_offline(true);
    let response = layer.serve(Request::get(url("/index.html"))).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "index v1");

    let response = layer.serve(Request::navigate(url("/index.html"))).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "index v1");
  }

  #[tokio::test]
  async fn test_partial_install_failure_is_not_fatal() {
    let network = online_network();
    let layer = layer(config(), network);

    let mut release = release("v1");
    release.manifest.push("/missing.png".into());
    let report = layer.install(&release).await.unwrap();

    assert_eq!(report.failed, vec!["/missing.png"]);
    assert_eq!(report.stored.len(), 3);
    assert_eq!(layer.store().list_names().unwrap(), vec!["app-v1"]);
  }

  #[tokio::test]
  async fn test_install_same_manifest_twice_is_idempotent() {
    let layer = layer(config(), online_network());
    layer.install(&release("v1")).await.unwrap();
    let first = layer.store().handle("app-v1").urls().unwrap();

    let report = layer.install(&release("v1")).await.unwrap();
    assert_eq!(report.state, LifecycleState::Active);
    let second = layer.store().handle("app-v1").urls().unwrap();

    assert_eq!(first, second);
    assert_eq!(layer.store().list_names().unwrap(), vec!["app-v1"]);
  }

  #[tokio::test]
  async fn test_backend_requests_are_never_stored() {
    let network = online_network();
    let backend = "https://backend.example/api/messages";
    network.route(backend, "[\"hello\"]");
    let layer = layer(config(), network.clone());
    layer.install(&release("v1")).await.unwrap();

    // Plant an entry under the identical key; bypass must ignore it
    let request = Request::get(Url::parse(backend).unwrap());
    let key = layer.store().key_for(&request);
    let planted = Response::new(200, vec![], b"planted".to_vec(), ResponseType::Basic);
    layer.store().handle("app-v1").put(&key, &planted).unwrap();
    let before = layer.store().handle("app-v1").urls().unwrap();

    let response = layer.serve(request.clone()).await;
    assert_eq!(response.text(), "[\"hello\"]");
    assert_eq!(network.hits(backend), 1);

    network.set_offline(true);
    let response = layer.serve(request).await;
    assert_eq!(response.status(), 503);

    let after = layer.store().handle("app-v1").urls().unwrap();
    assert_eq!(before, after);
    let stored = layer.store().handle("app-v1").lookup(&key).unwrap().unwrap();
    assert_eq!(stored.body, b"planted");
  }

  #[tokio::test]
  async fn test_failed_navigation_gets_offline_document() {
    let network = online_network();
    let layer = layer(config(), network.clone());
    let mut release = release("v1");
    release.manifest.push("/offline.html".into());
    layer.install(&release).await.unwrap();

    network.set_offline(true);
    let result = layer.serve_traced(Request::navigate(url("/notes/9"))).await;
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.status(), 200);
    assert_eq!(result.data.text(), "offline page");
  }

  #[tokio::test]
  async fn test_serve_is_total_without_any_generation() {
    let network = Arc::new(MockNetwork::new());
    network.set_offline(true);
    let layer = layer(config(), network);

    for request in [
      Request::navigate(url("/")),
      Request::get(url("/app.js")),
      Request::new("POST", url("/api")),
      Request::get(Url::parse("https://backend.example/x").unwrap()),
      Request::get(Url::parse("https://cdn.example/lib.js").unwrap()),
    ] {
      assert_eq!(layer.serve(request).await.status(), 503);
    }
  }

  #[tokio::test]
  async fn test_activate_keeps_exactly_one_generation() {
    let network = online_network();
    let layer = layer(config(), network);
    layer.install(&release("v1")).await.unwrap();

    layer.client_opened();
    layer.install(&release("v2")).await.unwrap();
    assert_eq!(layer.store().list_names().unwrap(), vec!["app-v1", "app-v2"]);

    let activated = layer.activate().await.unwrap();
    assert_eq!(activated.as_deref(), Some("app-v2"));
    assert_eq!(layer.store().list_names().unwrap(), vec!["app-v2"]);
    assert_eq!(layer.registration().state_of("v1"), Some(LifecycleState::Redundant));
  }

  #[tokio::test]
  async fn test_waiting_until_skip_waiting() {
    let network = online_network();
    let layer = layer(config(), network.clone());
    layer.install(&release("v1")).await.unwrap();

    // Two open tabs on v1
    layer.client_opened();
    layer.client_opened();

    network.route(url("/app.js").as_str(), "app v2");
    let report = layer.install(&release("v2")).await.unwrap();
    assert_eq!(report.state, LifecycleState::Waiting);
    assert_eq!(layer.registration().state_of("v1"), Some(LifecycleState::Active));
    assert_eq!(layer.registration().state_of("v2"), Some(LifecycleState::Waiting));

    // Still served from v1
    network.set_offline(true);
    assert_eq!(layer.serve(Request::get(url("/app.js"))).await.text(), "app v1");

    let reply = layer.handle_control(ControlMessage::SkipWaiting).await;
    assert_eq!(
      reply,
      ControlReply::Activated {
        generation: Some("app-v2".to_string())
      }
    );
    assert_eq!(layer.registration().state_of("v2"), Some(LifecycleState::Active));
    assert_eq!(layer.store().list_names().unwrap(), vec!["app-v2"]);
    assert_eq!(layer.serve(Request::get(url("/app.js"))).await.text(), "app v2");
  }

  #[tokio::test]
  async fn test_last_client_closing_activates_waiting() {
    let layer = layer(config(), online_network());
    layer.install(&release("v1")).await.unwrap();
    layer.client_opened();
    layer.install(&release("v2")).await.unwrap();

    assert_eq!(layer.client_closed().await.unwrap().as_deref(), Some("app-v2"));
    assert_eq!(layer.registration().active().unwrap().version, "v2");
  }

  #[tokio::test]
  async fn test_skip_waiting_on_install_config() {
    let mut config = config();
    config.skip_waiting_on_install = true;
    let layer = layer(config, online_network());
    layer.install(&release("v1")).await.unwrap();
    layer.client_opened();

    let report = layer.install(&release("v2")).await.unwrap();
    assert_eq!(report.state, LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_notifications_follow_lifecycle() {
    let layer = layer(config(), online_network());
    let mut notices = layer.subscribe();
    layer.install(&release("v1")).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
      seen.push(notice);
    }

    assert_eq!(
      seen.first(),
      Some(&LifecycleNotice::UpdateFound {
        version: "v1".into()
      })
    );
    assert_eq!(
      seen.last(),
      Some(&LifecycleNotice::ControllerChange {
        version: "v1".into()
      })
    );
    assert!(seen.contains(&LifecycleNotice::StateChange {
      version: "v1".into(),
      state: LifecycleState::Waiting
    }));
  }

  #[tokio::test]
  async fn test_swr_freshness_through_serve() {
    let network = online_network();
    let layer = layer(config(), network.clone());
    layer.install(&release("v1")).await.unwrap();

    network.route(url("/app.js").as_str(), "app v1.1");
    let first = layer.serve_traced(Request::get(url("/app.js"))).await;
    assert_eq!(first.source, CacheSource::Cache);
    assert_eq!(first.data.text(), "app v1");

    layer.settle().await;
    let second = layer.serve(Request::get(url("/app.js"))).await;
    assert_eq!(second.text(), "app v1.1");
  }

  #[tokio::test]
  async fn test_cache_urls_adds_to_active_generation() {
    let network = online_network();
    network.route(url("/extra.css").as_str(), "extra");
    let layer = layer(config(), network.clone());
    layer.install(&release("v1")).await.unwrap();

    let (stored, failed) = layer
      .cache_urls(&["/extra.css".to_string(), "/nope.css".to_string()])
      .await
      .unwrap();
    assert_eq!(stored, vec![url("/extra.css").to_string()]);
    assert_eq!(failed, vec!["/nope.css"]);

    network.set_offline(true);
    assert_eq!(layer.serve(Request::get(url("/extra.css"))).await.text(), "extra");
    assert_eq!(layer.store().list_names().unwrap(), vec!["app-v1"]);
  }

  #[tokio::test]
  async fn test_cache_urls_without_active_generation_fails() {
    let layer = layer(config(), online_network());
    assert!(layer.cache_urls(&["/app.js".to_string()]).await.is_err());
  }

  #[tokio::test]
  async fn test_clear_cache_repopulates_active() {
    let network = online_network();
    network.route(url("/extra.css").as_str(), "extra");
    let layer = layer(config(), network.clone());
    layer.install(&release("v1")).await.unwrap();
    layer.cache_urls(&["/extra.css".to_string()]).await.unwrap();

    let cleared = layer.clear_cache().await.unwrap();
    assert_eq!(cleared.as_deref(), Some("app-v1"));
    assert_eq!(layer.store().list_names().unwrap(), vec!["app-v1"]);

    let urls = layer.store().handle("app-v1").urls().unwrap();
    assert_eq!(urls.len(), 3);
    assert!(!urls.contains(&url("/extra.css").to_string()));
  }

  #[tokio::test]
  async fn test_clear_cache_concurrent_serve_sees_a_generation() {
    let network = online_network();
    network.delay(url("/app.js").as_str(), Duration::from_millis(30));
    let layer = Arc::new(layer(config(), network.clone()));
    layer.install(&release("v1")).await.unwrap();

    let clearing = {
      let layer = Arc::clone(&layer);
      tokio::spawn(async move { layer.clear_cache().await })
    };
    let serving: Vec<_> = (0..8)
      .map(|_| {
        let layer = Arc::clone(&layer);
        tokio::spawn(async move { layer.serve(Request::get(url("/index.html"))).await })
      })
      .collect();

    for handle in serving {
      assert_eq!(handle.await.unwrap().status(), 200);
    }
    clearing.await.unwrap().unwrap();
    assert_eq!(layer.store().list_names().unwrap(), vec!["app-v1"]);
  }

  #[tokio::test]
  async fn test_registration_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let network = online_network();

    {
      let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_at(&path).unwrap());
      let layer = InterceptionLayer::new(config(), storage, network.clone()).unwrap();
      layer.install(&release("v1")).await.unwrap();
      layer.client_opened();
      layer.install(&release("v2")).await.unwrap();
    }

    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_at(&path).unwrap());
    let layer = InterceptionLayer::new(config(), storage, network).unwrap();
    let registration = layer.registration();
    assert_eq!(registration.active().unwrap().version, "v1");
    assert_eq!(registration.waiting().unwrap().version, "v2");

    assert_eq!(layer.activate().await.unwrap().as_deref(), Some("app-v2"));
    assert_eq!(layer.store().list_names().unwrap(), vec!["app-v2"]);
  }

  #[tokio::test]
  async fn test_bypassed_urls_are_never_precached_or_added() {
    let config = Config::parse(
      r#"
scope: https://app.example/
cache_name: app
version: v1
backend:
  - host: app.example
    path_prefix: /api/
network_only: [/manifest.json]
"#,
    )
    .unwrap();
    let network = online_network();
    network
      .route(url("/api/notes").as_str(), "[]")
      .route(url("/api/messages").as_str(), "[]")
      .route(url("/manifest.json").as_str(), "{}");
    let layer = layer(config, network.clone());

    let release = Release::new(
      "v1",
      vec!["/index.html".into(), "/api/notes".into(), "/manifest.json".into()],
    );
    let report = layer.install(&release).await.unwrap();
    assert_eq!(report.stored, vec![url("/index.html").to_string()]);
    assert_eq!(report.failed, vec!["/api/notes", "/manifest.json"]);

    let reply = layer
      .handle_control(ControlMessage::CacheUrls {
        urls: vec!["/api/messages".to_string()],
      })
      .await;
    assert_eq!(
      reply,
      ControlReply::Cached {
        stored: vec![],
        failed: vec!["/api/messages".to_string()]
      }
    );

    assert_eq!(
      layer.store().handle("app-v1").urls().unwrap(),
      vec![url("/index.html").to_string()]
    );
    assert_eq!(network.hits(url("/api/messages").as_str()), 0);
  }

  #[tokio::test]
  async fn test_precached_page_serves_navigation_with_accept_vary() {
    let mut config = config();
    config.vary_headers = vec!["Accept".to_string()];
    let network = online_network();
    let layer = layer(config, network.clone());
    layer.install(&release("v1")).await.unwrap();

    network.set_offline(true);
    let result = layer.serve_traced(Request::navigate(url("/index.html"))).await;
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.status(), 200);
    assert_eq!(result.data.text(), "index v1");
  }

  /// Storage whose generation deletes always fail.
  struct StuckDeletes(SqliteStorage);

  impl CacheStorage for StuckDeletes {
    fn populate_generation(
      &self,
      record: &GenerationRecord,
      entries: &[CacheEntry],
    ) -> Result<()> {
      self.0.populate_generation(record, entries)
    }

    fn replace_all(&self, record: &GenerationRecord, entries: &[CacheEntry]) -> Result<()> {
      self.0.replace_all(record, entries)
    }

    fn get_entry(&self, generation: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
      self.0.get_entry(generation, key)
    }

    fn contains(&self, generation: &str, key: &RequestKey) -> Result<bool> {
      self.0.contains(generation, key)
    }

    fn put_entry(&self, generation: &str, entry: &CacheEntry) -> Result<bool> {
      self.0.put_entry(generation, entry)
    }

    fn delete_generation(&self, name: &str) -> Result<bool> {
      Err(eyre!("database is locked: {}", name))
    }

    fn generation_names(&self) -> Result<Vec<String>> {
      self.0.generation_names()
    }

    fn generations(&self) -> Result<Vec<GenerationRecord>> {
      self.0.generations()
    }

    fn set_state(&self, name: &str, state: LifecycleState) -> Result<()> {
      self.0.set_state(name, state)
    }

    fn entry_urls(&self, generation: &str) -> Result<Vec<String>> {
      self.0.entry_urls(generation)
    }
  }

  #[tokio::test]
  async fn test_activation_switches_serving_before_purging() {
    let network = online_network();
    let storage: Arc<dyn CacheStorage> =
      Arc::new(StuckDeletes(SqliteStorage::in_memory().unwrap()));
    let layer = InterceptionLayer::new(config(), storage, network.clone()).unwrap();
    layer.install(&release("v1")).await.unwrap();
    layer.client_opened();

    network.route(url("/app.js").as_str(), "app v2");
    layer.install(&release("v2")).await.unwrap();

    // The old generation cannot be purged, yet v2 already serves
    assert_eq!(layer.activate().await.unwrap().as_deref(), Some("app-v2"));
    assert_eq!(layer.registration().active().unwrap().version, "v2");

    network.set_offline(true);
    assert_eq!(layer.serve(Request::get(url("/app.js"))).await.text(), "app v2");

    // The leftover is no longer recorded as active
    let states: Vec<_> = layer
      .store()
      .records()
      .unwrap()
      .into_iter()
      .map(|r| (r.name, r.state))
      .collect();
    assert!(states.contains(&("app-v1".to_string(), LifecycleState::Redundant)));
    assert!(states.contains(&("app-v2".to_string(), LifecycleState::Active)));
  }

  #[tokio::test]
  async fn test_handle_dispatches_events() {
    let layer = layer(config(), online_network());
    let outcome = layer.handle(Event::Install(release("v1"))).await;
    assert!(matches!(outcome, Outcome::Installed(ref r) if r.state == LifecycleState::Active));

    let outcome = layer.handle(Event::Fetch(Request::get(url("/app.js")))).await;
    assert!(matches!(outcome, Outcome::Response(ref r) if r.status() == 200));

    let outcome = layer.handle(Event::Activate).await;
    assert!(matches!(outcome, Outcome::Activated(None)));

    let outcome = layer.handle(Event::Message(ControlMessage::ClearCache)).await;
    assert!(matches!(outcome, Outcome::Reply(ControlReply::Cleared { .. })));
  }
}

//! Scripted network used by the resolver and layer tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::client::{FetchError, Network};
use super::types::{Request, Response, ResponseType};

#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<String, Response>>,
  delays: Mutex<HashMap<String, Duration>>,
  hits: Mutex<HashMap<String, usize>>,
  total: AtomicUsize,
  offline: AtomicBool,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve a 200 basic response with the given body for `url`.
  pub fn route(&self, url: &str, body: &str) -> &Self {
    self.respond(
      url,
      Response::new(200, vec![], body.as_bytes().to_vec(), ResponseType::Basic),
    )
  }

  pub fn respond(&self, url: &str, response: Response) -> &Self {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
    self
  }

  pub fn delay(&self, url: &str, delay: Duration) -> &Self {
    self
      .delays
      .lock()
      .unwrap()
      .insert(url.to_string(), delay);
    self
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn hits(&self, url: &str) -> usize {
    self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
  }

  pub fn total_hits(&self) -> usize {
    self.total.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url().as_str().to_string();
    self.total.fetch_add(1, Ordering::SeqCst);
    *self.hits.lock().unwrap().entry(url.clone()).or_default() += 1;

    let delay = self.delays.lock().unwrap().get(&url).copied();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Unreachable(url));
    }

    let response = self.routes.lock().unwrap().get(&url).cloned();
    Ok(response.unwrap_or_else(|| {
      Response::new(404, vec![], b"not found".to_vec(), ResponseType::Basic)
    }))
  }
}

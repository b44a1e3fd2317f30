//! Core types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::lifecycle::LifecycleState;
use crate::net::{Request, Response, ResponseType};

/// Identity of a stored entry: method, normalized URL and any varied headers.
///
/// Logically identical requests always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
  vary: Vec<(String, String)>,
}

impl RequestKey {
  /// Derive the key for a request, folding in the listed headers.
  ///
  /// Absent headers contribute nothing. A navigation's `Accept` is left out,
  /// so a page precached by plain GET is found when the user opens it.
  pub fn for_request(request: &Request, vary_headers: &[String]) -> Self {
    let navigation = request.is_navigation();
    let mut vary: Vec<(String, String)> = vary_headers
      .iter()
      .map(|name| name.to_ascii_lowercase())
      .filter(|name| !(navigation && name == "accept"))
      .filter_map(|name| {
        let value = request.header(&name)?.trim().to_string();
        Some((name, value))
      })
      .filter(|(_, value)| !value.is_empty())
      .collect();
    vary.sort();
    vary.dedup_by(|a, b| a.0 == b.0);

    Self {
      method: request.method().to_string(),
      url: request.url().as_str().to_string(),
      vary,
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn hash(&self) -> String {
    let mut input = format!("{} {}", self.method, self.url);
    for (name, value) in &self.vary {
      input.push_str(&format!(" {}:{}", name, value));
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response captured into a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
  /// Take an independent copy of a response; the caller keeps the original.
  pub fn capture(response: &Response) -> Self {
    Self {
      status: response.status(),
      headers: response.headers().to_vec(),
      body: response.body().to_vec(),
      stored_at: Utc::now(),
    }
  }

  pub fn to_response(&self) -> Response {
    Response::new(
      self.status,
      self.headers.clone(),
      self.body.clone(),
      ResponseType::Basic,
    )
  }
}

/// One (key, response) pair ready to be written.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub response: StoredResponse,
}

/// Metadata for a persisted generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRecord {
  pub name: String,
  pub version: String,
  pub state: LifecycleState,
  /// Manifest the generation was populated from, used to repopulate it
  pub manifest: Vec<String>,
  pub created_at: DateTime<Utc>,
}

/// Result from a resolver attempt, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for the offline document.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Create a result built locally because nothing else was available.
  pub fn synthetic(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthetic,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Entry from the active generation
  Cache,
  /// Offline document served in place of a failed navigation
  Offline,
  /// Locally built 503
  Synthetic,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Synthetic => "synthetic",
    };
    f.write_str(label)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn request(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_key_is_stable_for_identical_requests() {
    let a = RequestKey::for_request(&request("https://APP.example:443/index.html#x"), &[]);
    let b = RequestKey::for_request(&request("https://app.example/index.html"), &[]);
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
    assert_eq!(a.hash().len(), 64);
  }

  #[test]
  fn test_key_distinguishes_method() {
    let url = Url::parse("https://app.example/").unwrap();
    let get = RequestKey::for_request(&Request::get(url.clone()), &[]);
    let head = RequestKey::for_request(&Request::new("HEAD", url), &[]);
    assert_ne!(get.hash(), head.hash());
  }

  #[test]
  fn test_vary_headers_fold_into_key() {
    let vary = vec!["Accept".to_string()];
    let webp = request("https://app.example/logo").with_header("Accept", "image/webp");
    let json = request("https://app.example/logo").with_header("Accept", "application/json");

    assert_ne!(
      RequestKey::for_request(&webp, &vary).hash(),
      RequestKey::for_request(&json, &vary).hash()
    );
    // Without vary configuration the header is ignored
    assert_eq!(
      RequestKey::for_request(&webp, &[]).hash(),
      RequestKey::for_request(&json, &[]).hash()
    );
  }

  #[test]
  fn test_navigation_matches_plain_get_under_accept_vary() {
    let vary = vec!["Accept".to_string()];
    let url = Url::parse("https://app.example/index.html").unwrap();
    let precached = RequestKey::for_request(&Request::get(url.clone()), &vary);
    let opened = RequestKey::for_request(&Request::navigate(url), &vary);
    assert_eq!(precached.hash(), opened.hash());
  }

  #[test]
  fn test_absent_vary_header_adds_nothing() {
    let vary = vec!["X-Locale".to_string()];
    let plain = request("https://app.example/app.js");
    let blank = request("https://app.example/app.js").with_header("X-Locale", " ");
    assert_eq!(
      RequestKey::for_request(&plain, &vary).hash(),
      RequestKey::for_request(&plain, &[]).hash()
    );
    assert_eq!(
      RequestKey::for_request(&blank, &vary).hash(),
      RequestKey::for_request(&plain, &vary).hash()
    );
  }

  #[test]
  fn test_capture_is_independent_copy() {
    let response = Response::new(200, vec![], b"body".to_vec(), ResponseType::Basic);
    let stored = StoredResponse::capture(&response);
    drop(response);
    assert_eq!(stored.to_response().text(), "body");
  }
}

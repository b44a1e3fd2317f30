//! Request classification into fetch policies.
//!
//! Rules are evaluated fresh for every request, in priority order; the
//! first matching rule wins:
//! 1. methods outside the cacheable set are bypassed
//! 2. backend hosts (document stores, AI endpoints, storage buckets) are bypassed
//! 3. network-only paths and, unless enabled, cross-origin requests are bypassed
//! 4. navigations are network-first
//! 5. everything else is cache-first until stored, then stale-while-revalidate

mod policies;

use serde::{Deserialize, Serialize};
use url::{Origin, Url};

use crate::net::Request;

pub use policies::{Bypass, CacheFirst, NetworkFirst, StaleWhileRevalidate, Strategy};

/// Fetch policy chosen per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
  /// Network only; never read from or written to a generation
  Bypass,
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl Policy {
  /// The strategy that executes this policy.
  pub fn strategy(self) -> &'static dyn Strategy {
    match self {
      Self::Bypass => &Bypass,
      Self::CacheFirst => &CacheFirst,
      Self::NetworkFirst => &NetworkFirst,
      Self::StaleWhileRevalidate => &StaleWhileRevalidate,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Bypass => "bypass",
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
    }
  }
}

impl std::fmt::Display for Policy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One entry of the backend exclusion list.
///
/// `host` is compared against the URL host: an exact name, or `*.domain`
/// for the domain and all of its subdomains. `path_prefix` narrows the rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendRule {
  pub host: String,
  #[serde(default)]
  pub path_prefix: Option<String>,
}

impl BackendRule {
  pub fn host(host: impl Into<String>) -> Self {
    Self {
      host: host.into(),
      path_prefix: None,
    }
  }

  pub fn matches(&self, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
      return false;
    };
    let host = host.to_ascii_lowercase();
    let pattern = self.host.to_ascii_lowercase();

    let host_matches = match pattern.strip_prefix("*.") {
      Some(domain) => host == domain || host.ends_with(&format!(".{}", domain)),
      None => host == pattern,
    };

    host_matches
      && self
        .path_prefix
        .as_deref()
        .map_or(true, |prefix| url.path().starts_with(prefix))
  }
}

/// Classifies requests into policies.
#[derive(Debug, Clone)]
pub struct StrategySelector {
  origin: Origin,
  backend: Vec<BackendRule>,
  network_only: Vec<String>,
  cacheable_methods: Vec<String>,
  cache_cross_origin: bool,
}

impl StrategySelector {
  /// Selector for the given scope, caching only same-origin GETs.
  pub fn new(scope: &Url) -> Self {
    Self {
      origin: scope.origin(),
      backend: Vec::new(),
      network_only: Vec::new(),
      cacheable_methods: vec!["GET".to_string()],
      cache_cross_origin: false,
    }
  }

  pub fn with_backend(mut self, rules: Vec<BackendRule>) -> Self {
    self.backend = rules;
    self
  }

  pub fn with_network_only(mut self, paths: Vec<String>) -> Self {
    self.network_only = paths;
    self
  }

  pub fn with_cacheable_methods(mut self, methods: &[String]) -> Self {
    self.cacheable_methods = methods.iter().map(|m| m.to_ascii_uppercase()).collect();
    self
  }

  pub fn with_cross_origin(mut self, enabled: bool) -> Self {
    self.cache_cross_origin = enabled;
    self
  }

  /// Whether the URL belongs to the backend service.
  pub fn is_backend(&self, url: &Url) -> bool {
    self.backend.iter().any(|rule| rule.matches(url))
  }

  /// Pick the policy for a request.
  ///
  /// `is_stored` is only consulted for requests that may be cached, so
  /// bypassed requests never touch the store.
  pub fn classify(&self, request: &Request, is_stored: impl FnOnce() -> bool) -> Policy {
    if !self.cacheable_methods.iter().any(|m| m == request.method()) {
      return Policy::Bypass;
    }

    if self.is_backend(request.url()) {
      return Policy::Bypass;
    }

    let same_origin = request.is_same_origin(&self.origin);
    if same_origin
      && self
        .network_only
        .iter()
        .any(|suffix| request.url().path().ends_with(suffix.as_str()))
    {
      return Policy::Bypass;
    }

    if !same_origin && !self.cache_cross_origin {
      return Policy::Bypass;
    }

    if request.is_navigation() {
      return Policy::NetworkFirst;
    }

    if is_stored() {
      Policy::StaleWhileRevalidate
    } else {
      Policy::CacheFirst
    }
  }
}

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use url::{Origin, Url};

use super::types::{Request, Response, ResponseType};

/// Why a network attempt produced no response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("network attempt timed out after {0:?}")]
  Timeout(Duration),
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// The network leg of every fetch policy.
///
/// A non-success status is still a response; only transport failures are errors.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Network access over HTTP via reqwest
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpClient {
  /// Create a client whose responses are typed relative to `scope`'s origin.
  pub fn new(scope: &Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("shellcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: scope.origin(),
    })
  }
}

#[async_trait]
impl Network for HttpClient {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method().as_bytes())
      .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", request.method(), e)))?;

    let mut builder = self.client.request(method, request.url().clone());
    for (name, value) in request.headers() {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::Unreachable(format!("{}: {}", request.url(), e)))?;

    let status = response.status().as_u16();
    let response_type = if response.url().origin() == self.origin {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    };
    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Unreachable(format!("{}: body: {}", request.url(), e)))?;

    Ok(Response::new(status, headers, body.to_vec(), response_type))
  }
}

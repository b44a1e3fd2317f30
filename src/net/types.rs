//! HTTP-shaped request and response values exchanged with the host page.

use std::borrow::Cow;

use url::{Origin, Url};

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document navigation
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// What the page intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  Document,
  Script,
  Style,
  Image,
  Font,
  Manifest,
  #[default]
  Other,
}

/// Provenance of a response, mirroring the fetch response types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseType {
  /// Same-origin, fully readable
  Basic,
  /// Cross-origin, readable through CORS
  Cors,
  /// Cross-origin, unreadable
  Opaque,
  /// Built locally, never came from the network
  #[default]
  Default,
}

/// An outgoing request intercepted from the host page.
#[derive(Debug, Clone)]
pub struct Request {
  method: String,
  url: Url,
  headers: Vec<(String, String)>,
  mode: RequestMode,
  destination: Destination,
}

impl Request {
  /// Build a request. The method is upper-cased and any fragment is dropped.
  pub fn new(method: &str, mut url: Url) -> Self {
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Vec::new(),
      mode: RequestMode::default(),
      destination: Destination::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// A top-level document navigation, as issued when the user opens a page.
  pub fn navigate(url: Url) -> Self {
    Self::get(url)
      .with_mode(RequestMode::Navigate)
      .with_destination(Destination::Document)
      .with_header("Accept", "text/html")
  }

  /// Set a header, replacing any previous value. Names are case-insensitive.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    let name = name.to_ascii_lowercase();
    self.headers.retain(|(n, _)| *n != name);
    self.headers.push((name, value.to_string()));
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn headers(&self) -> &[(String, String)] {
    &self.headers
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    let name = name.to_ascii_lowercase();
    self
      .headers
      .iter()
      .find(|(n, _)| *n == name)
      .map(|(_, v)| v.as_str())
  }

  pub fn mode(&self) -> RequestMode {
    self.mode
  }

  pub fn destination(&self) -> Destination {
    self.destination
  }

  /// Whether this request loads a top-level document.
  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
      || self.destination == Destination::Document
      || self
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html"))
  }

  pub fn is_same_origin(&self, origin: &Origin) -> bool {
    self.url.origin() == *origin
  }
}

/// Resolve a possibly relative URL against a base, e.g. a manifest path against the scope.
pub fn resolve_url(base: &Url, raw: &str) -> Result<Url, url::ParseError> {
  let mut url = base.join(raw)?;
  url.set_fragment(None);
  Ok(url)
}

/// A concrete HTTP-shaped response handed back to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  status: u16,
  headers: Vec<(String, String)>,
  body: Vec<u8>,
  response_type: ResponseType,
}

impl Response {
  pub fn new(
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    response_type: ResponseType,
  ) -> Self {
    Self {
      status,
      headers,
      body,
      response_type,
    }
  }

  /// The synthetic 503 returned when every other source is exhausted.
  pub fn service_unavailable(reason: &str) -> Self {
    Self {
      status: 503,
      headers: vec![(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
      )],
      body: reason.as_bytes().to_vec(),
      response_type: ResponseType::Default,
    }
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  pub fn headers(&self) -> &[(String, String)] {
    &self.headers
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn body(&self) -> &[u8] {
    &self.body
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }

  pub fn response_type(&self) -> ResponseType {
    self.response_type
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether the response may be written to a generation.
  ///
  /// Partial content, error statuses and opaque responses are never stored.
  /// CORS responses are stored only when cross-origin caching is enabled.
  pub fn is_persistable(&self, allow_cors: bool) -> bool {
    if !self.is_success() || self.status == 206 {
      return false;
    }
    match self.response_type {
      ResponseType::Basic => true,
      ResponseType::Cors => allow_cors,
      ResponseType::Opaque | ResponseType::Default => false,
    }
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::lifecycle::Release;
use crate::net::resolve_url;
use crate::strategy::BackendRule;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the application; its origin defines same-origin
  #[serde(deserialize_with = "deserialize_scope")]
  pub scope: Url,
  /// Generation name prefix, e.g. "notes-app" for "notes-app-v3"
  pub cache_name: String,
  pub version: String,
  /// Resources precached at install time, relative to the scope
  #[serde(default)]
  pub manifest: Vec<String>,
  /// Page served for failed navigations
  pub offline_document: Option<String>,
  #[serde(default)]
  pub backend: Vec<BackendRule>,
  /// Same-origin path suffixes always fetched from the network
  #[serde(default)]
  pub network_only: Vec<String>,
  #[serde(default = "default_network_timeout_ms")]
  pub network_timeout_ms: Option<u64>,
  #[serde(default)]
  pub cache_cross_origin: bool,
  #[serde(default = "default_cacheable_methods")]
  pub cacheable_methods: Vec<String>,
  #[serde(default)]
  pub vary_headers: Vec<String>,
  #[serde(default)]
  pub skip_waiting_on_install: bool,
  #[serde(default = "default_precache_concurrency")]
  pub precache_concurrency: usize,
  /// SQLite database path (defaults to the user data directory)
  pub database: Option<PathBuf>,
}

fn deserialize_scope<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let raw = String::deserialize(deserializer)?;
  let mut url = Url::parse(&raw).map_err(serde::de::Error::custom)?;
  // Relative manifest paths resolve against the scope directory
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

fn default_network_timeout_ms() -> Option<u64> {
  Some(10_000)
}

fn default_cacheable_methods() -> Vec<String> {
  vec!["GET".to_string()]
}

fn default_precache_concurrency() -> usize {
  6
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shellcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse and validate configuration from YAML text.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.precache_concurrency == 0 {
      return Err(eyre!("precache_concurrency must be at least 1"));
    }
    for path in &self.manifest {
      resolve_url(&self.scope, path)
        .map_err(|e| eyre!("Invalid manifest entry '{}': {}", path, e))?;
    }
    self.offline_document_url()?;
    Ok(())
  }

  /// The release described by this file.
  pub fn release(&self) -> Release {
    Release::new(self.version.clone(), self.manifest.clone())
  }

  pub fn network_timeout(&self) -> Option<Duration> {
    self.network_timeout_ms.map(Duration::from_millis)
  }

  pub fn offline_document_url(&self) -> Result<Option<Url>> {
    self
      .offline_document
      .as_deref()
      .map(|path| {
        resolve_url(&self.scope, path)
          .map_err(|e| eyre!("Invalid offline_document '{}': {}", path, e))
      })
      .transpose()
  }

  /// Generation name for a version, e.g. "notes-app-v3".
  pub fn generation_name(&self, version: &str) -> String {
    format!("{}-{}", self.cache_name, version)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
scope: https://notes.example/app
cache_name: notes
version: v1
"#;

  #[test]
  fn test_defaults() {
    let config = Config::parse(MINIMAL).unwrap();
    assert_eq!(config.scope.as_str(), "https://notes.example/app/");
    assert!(config.manifest.is_empty());
    assert_eq!(config.network_timeout(), Some(Duration::from_secs(10)));
    assert_eq!(config.cacheable_methods, vec!["GET"]);
    assert!(!config.cache_cross_origin);
    assert!(!config.skip_waiting_on_install);
    assert_eq!(config.precache_concurrency, 6);
    assert_eq!(config.generation_name("v1"), "notes-v1");
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
scope: https://notes.example/
cache_name: notes
version: v3
manifest: ["./", "./index.html", "./app.js"]
offline_document: ./index.html
backend:
  - host: "*.googleapis.com"
  - host: backend.example
    path_prefix: /api/
network_only: ["/manifest.json"]
network_timeout_ms: null
cache_cross_origin: true
vary_headers: [Accept]
skip_waiting_on_install: true
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.release().manifest.len(), 3);
    assert_eq!(config.backend[1].path_prefix.as_deref(), Some("/api/"));
    assert_eq!(config.network_timeout(), None);
    assert_eq!(
      config.offline_document_url().unwrap().unwrap().as_str(),
      "https://notes.example/index.html"
    );
  }

  #[test]
  fn test_rejects_bad_scope() {
    let yaml = "scope: not a url\ncache_name: notes\nversion: v1\n";
    assert!(Config::parse(yaml).is_err());
  }

  #[test]
  fn test_rejects_empty_version() {
    let yaml = "scope: https://notes.example/\ncache_name: notes\nversion: ''\n";
    assert!(Config::parse(yaml).is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shellcache.yaml");
    std::fs::write(&path, MINIMAL).unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.cache_name, "notes");

    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }
}

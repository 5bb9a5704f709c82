//! Network-mode policy, query/mutation defaults and the application config file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Whether operations attempt network access given the connectivity signal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
  /// Always issue the request and let the transport report failures
  #[default]
  Always,
  /// Pause while offline and resume once connectivity returns
  #[serde(alias = "online")]
  OnlineOnly,
  /// Issue the first attempt regardless, pause retries while offline
  #[serde(alias = "offlineFirst")]
  OfflineFirst,
}

impl NetworkMode {
  /// Whether a first attempt may be issued.
  pub fn can_fetch(self, online: bool) -> bool {
    match self {
      NetworkMode::Always | NetworkMode::OfflineFirst => true,
      NetworkMode::OnlineOnly => online,
    }
  }

  /// Whether a retry may be issued.
  pub fn can_retry(self, online: bool) -> bool {
    match self {
      NetworkMode::Always => true,
      NetworkMode::OnlineOnly | NetworkMode::OfflineFirst => online,
    }
  }
}

/// Defaults applied to every query entry at creation time.
///
/// Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct QueryDefaults {
  pub network_mode: NetworkMode,
  /// How long fetched data counts as fresh
  pub stale_time: u64,
  /// How long an unobserved entry is kept before eviction
  pub gc_time: u64,
  /// Number of retries after the first failed attempt
  pub retry: u32,
  /// Fixed delay between retries; exponential backoff when unset
  pub retry_delay: Option<u64>,
  /// Per-attempt timeout
  pub timeout: u64,
}

impl Default for QueryDefaults {
  fn default() -> Self {
    Self {
      network_mode: NetworkMode::default(),
      stale_time: 0,
      gc_time: 5 * 60 * 1000,
      retry: 3,
      retry_delay: None,
      timeout: 30_000,
    }
  }
}

/// Defaults applied to every mutation entry at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct MutationDefaults {
  pub network_mode: NetworkMode,
  pub gc_time: u64,
  pub retry: u32,
  pub retry_delay: Option<u64>,
  pub timeout: u64,
}

impl Default for MutationDefaults {
  fn default() -> Self {
    Self {
      network_mode: NetworkMode::default(),
      gc_time: 5 * 60 * 1000,
      retry: 0,
      retry_delay: None,
      timeout: 30_000,
    }
  }
}

/// Static policy object for a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct DefaultOptions {
  pub queries: QueryDefaults,
  pub mutations: MutationDefaults,
}

impl DefaultOptions {
  /// Parse defaults from a YAML (or JSON) document, rejecting unknown options.
  pub fn from_yaml(source: &str) -> Result<Self> {
    let options: DefaultOptions =
      serde_yaml::from_str(source).map_err(|e| Error::Configuration(e.to_string()))?;
    options.validate()?;
    Ok(options)
  }

  /// Check values that deserialize fine but make no sense.
  pub fn validate(&self) -> Result<()> {
    if self.queries.timeout == 0 {
      return Err(Error::Configuration(
        "queries.timeout must be greater than zero".to_string(),
      ));
    }
    if self.mutations.timeout == 0 {
      return Err(Error::Configuration(
        "mutations.timeout must be greater than zero".to_string(),
      ));
    }
    Ok(())
  }
}

/// Retry and network behaviour resolved from the defaults for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub network_mode: NetworkMode,
  pub retry: u32,
  pub retry_delay: Option<Duration>,
  pub timeout: Duration,
}

impl RetryPolicy {
  /// Delay before the next attempt after `failure_count` failures.
  pub fn delay(&self, failure_count: u32) -> Duration {
    match self.retry_delay {
      Some(delay) => delay,
      None => {
        let millis = 1000u64.saturating_mul(1u64 << failure_count.min(16));
        Duration::from_millis(millis.min(30_000))
      }
    }
  }
}

/// Resolved options for one query entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  pub retry: RetryPolicy,
  pub stale_time: Duration,
  pub gc_time: Duration,
}

impl From<&QueryDefaults> for QueryOptions {
  fn from(defaults: &QueryDefaults) -> Self {
    Self {
      retry: RetryPolicy {
        network_mode: defaults.network_mode,
        retry: defaults.retry,
        retry_delay: defaults.retry_delay.map(Duration::from_millis),
        timeout: Duration::from_millis(defaults.timeout),
      },
      stale_time: Duration::from_millis(defaults.stale_time),
      gc_time: Duration::from_millis(defaults.gc_time),
    }
  }
}

/// Resolved options for one mutation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOptions {
  pub retry: RetryPolicy,
  pub gc_time: Duration,
}

impl From<&MutationDefaults> for MutationOptions {
  fn from(defaults: &MutationDefaults) -> Self {
    Self {
      retry: RetryPolicy {
        network_mode: defaults.network_mode,
        retry: defaults.retry,
        retry_delay: defaults.retry_delay.map(Duration::from_millis),
        timeout: Duration::from_millis(defaults.timeout),
      },
      gc_time: Duration::from_millis(defaults.gc_time),
    }
  }
}

/// HTTP agent options for the bundled transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HttpConfig {
  /// Base URL that relative targets are resolved against
  pub base_url: Option<String>,
  pub user_agent: String,
  /// Whole-request timeout in milliseconds
  pub timeout: u64,
  /// Extra headers sent with every request
  pub headers: BTreeMap<String, String>,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      user_agent: format!("fetchq/{}", env!("CARGO_PKG_VERSION")),
      timeout: 30_000,
      headers: BTreeMap::new(),
    }
  }
}

/// On-disk persistence of successful query results.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct StorageConfig {
  pub enabled: bool,
  /// Database path (defaults to $XDG_DATA_HOME/fetchq/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LoggingConfig {
  /// Filter directive, e.g. "info" or "fetchq=debug"
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "warn".to_string(),
      file: None,
    }
  }
}

/// Application configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Config {
  pub default_options: DefaultOptions,
  pub http: HttpConfig,
  pub storage: StorageConfig,
  pub logging: LoggingConfig,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./fetchq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fetchq/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Configuration(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fetchq.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fetchq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      Error::Configuration(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_yaml(&contents)
      .map_err(|e| Error::Configuration(format!("{} ({})", e, path.display())))
  }

  pub fn from_yaml(source: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(source).map_err(|e| Error::Configuration(e.to_string()))?;
    config.default_options.validate()?;
    if config.http.timeout == 0 {
      return Err(Error::Configuration(
        "http.timeout must be greater than zero".to_string(),
      ));
    }
    Ok(config)
  }

  /// Resolved database path for the SQLite backend.
  pub fn storage_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.storage.path {
      return Ok(path.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Configuration("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("fetchq").join("cache.db"))
  }

  /// Optional bearer token for the HTTP transport.
  ///
  /// Reads FETCHQ_TOKEN.
  pub fn auth_token() -> Option<String> {
    std::env::var("FETCHQ_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_network_mode_parsing() {
    let options = DefaultOptions::from_yaml(
      "queries: { networkMode: always }\nmutations: { networkMode: offline-first }",
    )
    .unwrap();
    assert_eq!(options.queries.network_mode, NetworkMode::Always);
    assert_eq!(options.mutations.network_mode, NetworkMode::OfflineFirst);

    let options = DefaultOptions::from_yaml("queries: { networkMode: online }").unwrap();
    assert_eq!(options.queries.network_mode, NetworkMode::OnlineOnly);
    assert_eq!(options.mutations, MutationDefaults::default());
  }

  #[test]
  fn test_unknown_option_rejected() {
    let err = DefaultOptions::from_yaml("queries: { networkMode: always, refetchOnFocus: true }")
      .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    let err = DefaultOptions::from_yaml("subscriptions: {}").unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
  }

  #[test]
  fn test_invalid_network_mode_rejected() {
    let err = DefaultOptions::from_yaml("queries: { networkMode: sometimes }").unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
  }

  #[test]
  fn test_zero_timeout_rejected() {
    let err = DefaultOptions::from_yaml("queries: { timeout: 0 }").unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
  }

  #[test]
  fn test_network_mode_admission() {
    assert!(NetworkMode::Always.can_fetch(false));
    assert!(NetworkMode::Always.can_retry(false));
    assert!(!NetworkMode::OnlineOnly.can_fetch(false));
    assert!(NetworkMode::OnlineOnly.can_fetch(true));
    assert!(NetworkMode::OfflineFirst.can_fetch(false));
    assert!(!NetworkMode::OfflineFirst.can_retry(false));
  }

  #[test]
  fn test_retry_delay_backoff() {
    let policy = RetryPolicy {
      network_mode: NetworkMode::Always,
      retry: 3,
      retry_delay: None,
      timeout: Duration::from_secs(30),
    };
    assert_eq!(policy.delay(0), Duration::from_secs(1));
    assert_eq!(policy.delay(1), Duration::from_secs(2));
    assert_eq!(policy.delay(3), Duration::from_secs(8));
    assert_eq!(policy.delay(10), Duration::from_secs(30));

    let fixed = RetryPolicy {
      retry_delay: Some(Duration::from_millis(5)),
      ..policy
    };
    assert_eq!(fixed.delay(7), Duration::from_millis(5));
  }

  #[test]
  fn test_app_config_defaults_and_sections() {
    let config = Config::from_yaml(
      r#"
defaultOptions:
  queries:
    networkMode: always
    retry: 0
http:
  baseUrl: https://api.example.com/
  headers:
    x-client: fetchq
storage:
  enabled: true
  path: /tmp/fetchq-test.db
"#,
    )
    .unwrap();
    assert_eq!(config.default_options.queries.retry, 0);
    assert_eq!(config.default_options.queries.timeout, 30_000);
    assert_eq!(config.http.base_url.as_deref(), Some("https://api.example.com/"));
    assert_eq!(config.http.headers.get("x-client").map(String::as_str), Some("fetchq"));
    assert!(config.storage.enabled);
    assert_eq!(
      config.storage_path().unwrap(),
      PathBuf::from("/tmp/fetchq-test.db")
    );
    assert_eq!(config.logging.level, "warn");
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let err = Config::load(Some(Path::new("/nonexistent/fetchq.yaml"))).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
  }
}

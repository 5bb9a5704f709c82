//! Logging setup.
//!
//! Filter priority (highest first): the `FETCHQ_LOG` environment variable,
//! the `-v` flag, then `logging.level` from the config file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

pub const LOG_ENV: &str = "FETCHQ_LOG";

fn build_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
  if let Ok(directive) = std::env::var(LOG_ENV) {
    return EnvFilter::try_new(&directive)
      .map_err(|e| Error::Configuration(format!("Invalid {} '{}': {}", LOG_ENV, directive, e)));
  }
  let level = if verbose { "debug" } else { config.level.as_str() };
  EnvFilter::try_new(level)
    .map_err(|e| Error::Configuration(format!("Invalid log level '{}': {}", level, e)))
}

/// Install the global subscriber.
///
/// Logs go to stderr unless `config.file` is set. The returned guard must be
/// held until exit so buffered file output is flushed.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = build_filter(config, verbose)?;

  match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| Error::Configuration(format!("Invalid log file path: {}", path.display())))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| Error::Configuration(format!("Failed to create log directory: {}", e)))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| Error::Configuration(format!("Failed to initialize logging: {}", e)))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::Configuration(format!("Failed to initialize logging: {}", e)))?;
      Ok(None)
    }
  }
}

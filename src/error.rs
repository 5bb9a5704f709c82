//! Error types shared by queries, mutations and the client.

use std::time::Duration;
use thiserror::Error;

use crate::key::QueryKey;

/// Errors produced by the query client.
///
/// Errors are `Clone` because the same failure is stored in entry state,
/// handed to every subscriber and returned to every caller attached to a
/// coalesced fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
  /// The transport could not reach the remote end.
  #[error("Network error: {0}")]
  Network(String),

  /// A single attempt exceeded the configured timeout.
  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  /// The transport answered but the operation failed (bad status, undecodable body).
  #[error("Fetch failed: {0}")]
  Fetch(String),

  /// Invalid or unrecognized configuration.
  #[error("Invalid configuration: {0}")]
  Configuration(String),

  /// No entry is registered for the key.
  #[error("No query registered for key {0}")]
  NotFound(QueryKey),

  /// The entry has never been given a query function.
  #[error("Query {0} has no query function")]
  MissingFetcher(QueryKey),

  /// The fetch was cancelled before it settled.
  #[error("Fetch was cancelled")]
  Cancelled,

  /// The persistence backend failed.
  #[error("Cache storage error: {0}")]
  Storage(String),
}

impl Error {
  /// Whether this error came from the transport layer.
  pub fn is_network(&self) -> bool {
    matches!(self, Error::Network(_) | Error::Timeout(_))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

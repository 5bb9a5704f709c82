//! Query keys.
//!
//! A key is an ordered sequence of primitive values identifying one remote
//! resource, e.g. `["user", 42]`. Keys compare structurally, so two keys built
//! independently from the same parts address the same cache entry.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// One primitive component of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Bool(bool),
  Int(i64),
  Str(String),
  Null,
}

impl From<&str> for KeyPart {
  fn from(value: &str) -> Self {
    KeyPart::Str(value.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(value: String) -> Self {
    KeyPart::Str(value)
  }
}

impl From<&String> for KeyPart {
  fn from(value: &String) -> Self {
    KeyPart::Str(value.clone())
  }
}

impl From<bool> for KeyPart {
  fn from(value: bool) -> Self {
    KeyPart::Bool(value)
  }
}

impl From<i32> for KeyPart {
  fn from(value: i32) -> Self {
    KeyPart::Int(value.into())
  }
}

impl From<i64> for KeyPart {
  fn from(value: i64) -> Self {
    KeyPart::Int(value)
  }
}

impl From<u32> for KeyPart {
  fn from(value: u32) -> Self {
    KeyPart::Int(value.into())
  }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(KeyPart::Null)
  }
}

/// Structural identifier of a query entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  pub fn new(parts: Vec<KeyPart>) -> Self {
    Self(parts)
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// True when `prefix` matches the leading parts of this key.
  ///
  /// The empty key is a prefix of every key, and every key is a prefix of itself.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Stable, fixed-length hash of the key for use as a storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match serde_json::to_string(&self.0) {
      Ok(json) => f.write_str(&json),
      Err(_) => write!(f, "{:?}", self.0),
    }
  }
}

impl FromStr for QueryKey {
  type Err = Error;

  /// Parse a key from its JSON array form, e.g. `["user", 42]`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    serde_json::from_str(s).map_err(|e| Error::Configuration(format!("Invalid query key '{}': {}", s, e)))
  }
}

impl<T: Into<KeyPart>> From<Vec<T>> for QueryKey {
  fn from(parts: Vec<T>) -> Self {
    Self(parts.into_iter().map(Into::into).collect())
  }
}

impl From<&str> for QueryKey {
  fn from(value: &str) -> Self {
    Self(vec![value.into()])
  }
}

impl From<&QueryKey> for QueryKey {
  fn from(value: &QueryKey) -> Self {
    value.clone()
  }
}

/// Build a [`QueryKey`] from heterogeneous parts.
///
/// ```
/// use fetchq::query_key;
/// let key = query_key!["user", 42];
/// assert_eq!(key.to_string(), r#"["user",42]"#);
/// ```
#[macro_export]
macro_rules! query_key {
  () => {
    $crate::key::QueryKey::default()
  };
  ($($part:expr),+ $(,)?) => {
    $crate::key::QueryKey::new(vec![$($crate::key::KeyPart::from($part)),+])
  };
}

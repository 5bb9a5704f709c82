//! Transport capability and the bundled HTTP implementation.

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::key::QueryKey;
use crate::query::{query_fn, QueryFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl std::str::FromStr for Method {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(Error::Configuration(format!("Unsupported method: {}", other))),
    }
  }
}

/// One request issued through a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  /// Absolute URL, or a path resolved against the transport's base URL
  pub target: String,
  pub body: Option<Value>,
}

impl Request {
  pub fn get(target: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      target: target.into(),
      body: None,
    }
  }

  pub fn new(method: Method, target: impl Into<String>, body: Option<Value>) -> Self {
    Self {
      method,
      target: target.into(),
      body,
    }
  }

  /// Cache key for a read request: `[METHOD, target]`.
  pub fn query_key(&self) -> QueryKey {
    crate::query_key![self.method.as_str(), self.target.as_str()]
  }
}

/// Something that can carry a request and return its decoded payload.
pub trait Transport: Send + Sync {
  fn request(&self, request: Request) -> BoxFuture<'static, Result<Value>>;
}

/// Query function issuing `request` through `transport` on every attempt.
pub fn request_fn(transport: Arc<dyn Transport>, request: Request) -> QueryFn {
  query_fn(move || transport.request(request.clone()))
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Option<Url>,
  timeout: Duration,
}

impl HttpTransport {
  pub fn new(config: &HttpConfig, bearer_token: Option<&str>) -> Result<Self> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Configuration(format!("Invalid header name '{}': {}", name, e)))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| Error::Configuration(format!("Invalid header value for '{}': {}", name, e)))?;
      headers.insert(name, value);
    }
    if let Some(token) = bearer_token {
      let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| Error::Configuration(format!("Invalid bearer token: {}", e)))?;
      value.set_sensitive(true);
      headers.insert(AUTHORIZATION, value);
    }

    let base_url = config
      .base_url
      .as_deref()
      .map(Url::parse)
      .transpose()
      .map_err(|e| Error::Configuration(format!("Invalid base URL: {}", e)))?;

    let timeout = Duration::from_millis(config.timeout);
    let client = reqwest::Client::builder()
      .user_agent(&config.user_agent)
      .timeout(timeout)
      .default_headers(headers)
      .build()
      .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      timeout,
    })
  }

  /// Resolve a target against the base URL.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    match Url::parse(target) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => {
        let base = self.base_url.as_ref().ok_or_else(|| {
          Error::Configuration(format!("Relative target '{}' but no base URL configured", target))
        })?;
        base
          .join(target)
          .map_err(|e| Error::Configuration(format!("Invalid target '{}': {}", target, e)))
      }
      Err(e) => Err(Error::Configuration(format!("Invalid target '{}': {}", target, e))),
    }
  }

  async fn send(
    client: reqwest::Client,
    timeout: Duration,
    url: Url,
    request: Request,
  ) -> Result<Value> {
    let map_error = |e: reqwest::Error| map_reqwest_error(e, timeout);
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = client.request(method, url.clone());
    if let Some(body) = &request.body {
      let body = serde_json::to_vec(body)
        .map_err(|e| Error::Fetch(format!("Failed to encode request body: {}", e)))?;
      builder = builder.header(CONTENT_TYPE, "application/json").body(body);
    }

    tracing::debug!(method = request.method.as_str(), %url, "Sending request");
    let response = builder.send().await.map_err(map_error)?;

    let status = response.status();
    if !status.is_success() {
      return Err(Error::Fetch(format!("HTTP {} from {}", status, url)));
    }

    let bytes = response.bytes().await.map_err(map_error)?;
    Ok(decode_body(&bytes))
  }
}

impl Transport for HttpTransport {
  fn request(&self, request: Request) -> BoxFuture<'static, Result<Value>> {
    let client = self.client.clone();
    match self.resolve(&request.target) {
      Ok(url) => Self::send(client, self.timeout, url, request).boxed(),
      Err(e) => futures::future::ready(Err(e)).boxed(),
    }
  }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> Error {
  if e.is_timeout() {
    Error::Timeout(timeout)
  } else if e.is_connect() || e.is_request() || e.is_body() {
    Error::Network(e.to_string())
  } else {
    Error::Fetch(e.to_string())
  }
}

/// JSON when the body parses as JSON, a string otherwise, null when empty.
fn decode_body(bytes: &[u8]) -> Value {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  fn transport(base_url: Option<&str>) -> HttpTransport {
    HttpTransport::new(
      &HttpConfig {
        base_url: base_url.map(String::from),
        ..HttpConfig::default()
      },
      None,
    )
    .unwrap()
  }

  #[test]
  fn test_resolve_targets() {
    let t = transport(Some("https://api.example.com/v1/"));
    assert_eq!(
      t.resolve("users/42").unwrap().as_str(),
      "https://api.example.com/v1/users/42"
    );
    assert_eq!(
      t.resolve("https://other.example.com/x").unwrap().as_str(),
      "https://other.example.com/x"
    );

    let bare = transport(None);
    assert!(matches!(bare.resolve("users/42"), Err(Error::Configuration(_))));
  }

  #[test]
  fn test_invalid_header_rejected() {
    let mut headers = BTreeMap::new();
    headers.insert("bad header".to_string(), "x".to_string());
    let result = HttpTransport::new(
      &HttpConfig {
        headers,
        ..HttpConfig::default()
      },
      None,
    );
    assert!(matches!(result, Err(Error::Configuration(_))));
  }

  #[test]
  fn test_decode_body() {
    assert_eq!(decode_body(b""), Value::Null);
    assert_eq!(decode_body(b"  \n"), Value::Null);
    assert_eq!(decode_body(br#"{"a":1}"#), serde_json::json!({"a": 1}));
    assert_eq!(decode_body(b"plain text"), Value::String("plain text".to_string()));
  }

  #[test]
  fn test_request_key_and_method() {
    let request = Request::get("https://example.com/todos");
    assert_eq!(request.query_key(), crate::query_key!["GET", "https://example.com/todos"]);
    assert_eq!("patch".parse::<Method>().unwrap(), Method::Patch);
    assert!("TRACE".parse::<Method>().is_err());
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    // Port 9 on localhost is expected to refuse connections.
    let t = transport(None);
    let err = t
      .request(Request::get("http://127.0.0.1:9/"))
      .await
      .unwrap_err();
    assert!(err.is_network(), "unexpected error: {:?}", err);
  }

  #[tokio::test]
  async fn test_silent_server_times_out() {
    // Connections are queued in the backlog but never answered.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let t = HttpTransport::new(
      &HttpConfig {
        timeout: 100,
        ..HttpConfig::default()
      },
      None,
    )
    .unwrap();

    let err = t
      .request(Request::get(format!("http://{}/", addr)))
      .await
      .unwrap_err();
    assert_eq!(err, Error::Timeout(Duration::from_millis(100)));
    drop(listener);
  }
}

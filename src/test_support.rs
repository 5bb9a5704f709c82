//! Fixtures shared by unit tests.

use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::online::OnlineManager;
use crate::query::{query_fn, QueryFn, QueryState};

/// Query function that counts calls and always returns `value`.
pub fn counting_fn(calls: Arc<AtomicU32>, value: Value) -> QueryFn {
  query_fn(move || {
    let calls = calls.clone();
    let value = value.clone();
    async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(value)
    }
  })
}

pub fn failing_fn(error: Error) -> QueryFn {
  query_fn(move || {
    let error = error.clone();
    async move { Err(error) }
  })
}

/// Transport stand-in that fails with a network error whenever `online` reports offline.
pub fn connectivity_fn(online: OnlineManager, calls: Arc<AtomicU32>, value: Value) -> QueryFn {
  query_fn(move || {
    let online = online.clone();
    let calls = calls.clone();
    let value = value.clone();
    async move {
      calls.fetch_add(1, Ordering::SeqCst);
      if online.is_online() {
        Ok(value)
      } else {
        Err(Error::Network("network is unreachable".to_string()))
      }
    }
  })
}

/// Callback that records every state it receives.
#[allow(clippy::type_complexity)]
pub fn recorder() -> (
  Arc<Mutex<Vec<QueryState>>>,
  impl Fn(&QueryState) + Send + Sync + 'static,
) {
  let seen = Arc::new(Mutex::new(Vec::new()));
  let sink = seen.clone();
  (seen, move |state: &QueryState| {
    sink.lock().unwrap().push(state.clone())
  })
}

//! Query entries: cached results of read-style operations.
//!
//! A [`Query`] owns the state of one key. Fetches are coalesced: while a
//! fetch is in flight every caller receives a clone of the same shared
//! future, and a spawned driver task carries it to completion even if all
//! callers stop waiting.
//!
//! # Example
//!
//! ```ignore
//! let query = client.get_or_create(query_key!["user", 42]);
//! let _sub = query.subscribe(|state| println!("{:?}", state.status));
//! let user = query.fetch_with(query_fn(|| async { load_user(42).await })).await?;
//! ```

use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::cache::QueryCache;
use crate::config::QueryOptions;
use crate::error::{Error, Result};
use crate::event::CacheEvent;
use crate::key::QueryKey;
use crate::online::OnlineManager;
use crate::retryer::{RetryHooks, Retryer};

/// A factory that creates futures for fetching data.
pub type QueryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// The future every caller attached to one in-flight fetch awaits.
pub type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Value>>>>;

/// Box a closure into a [`QueryFn`].
///
/// The closure is called once per attempt, so retries re-issue the request.
pub fn query_fn<F, Fut>(f: F) -> QueryFn
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value>> + Send + 'static,
{
  Arc::new(move || f().boxed())
}

/// Whether the entry holds a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// No data and no error yet
  Pending,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed
  Error,
}

/// Whether a fetch is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
  Idle,
  Fetching,
  /// Waiting for connectivity
  Paused,
}

/// Snapshot of a query entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
  pub status: QueryStatus,
  pub fetch_status: FetchStatus,
  /// Last successfully fetched payload; kept across later failures
  pub data: Option<Arc<Value>>,
  pub data_updated_at: Option<DateTime<Utc>>,
  pub error: Option<Error>,
  pub error_updated_at: Option<DateTime<Utc>>,
  /// Failed attempts of the current or last fetch
  pub failure_count: u32,
  pub failure_reason: Option<Error>,
  pub is_invalidated: bool,
}

impl Default for QueryState {
  fn default() -> Self {
    Self {
      status: QueryStatus::Pending,
      fetch_status: FetchStatus::Idle,
      data: None,
      data_updated_at: None,
      error: None,
      error_updated_at: None,
      failure_count: 0,
      failure_reason: None,
      is_invalidated: false,
    }
  }
}

impl QueryState {
  /// State of an entry restored from persisted data.
  pub fn hydrated(data: Value, updated_at: DateTime<Utc>) -> Self {
    Self {
      status: QueryStatus::Success,
      data: Some(Arc::new(data)),
      data_updated_at: Some(updated_at),
      ..Self::default()
    }
  }

  pub fn is_pending(&self) -> bool {
    self.status == QueryStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn is_fetching(&self) -> bool {
    self.fetch_status == FetchStatus::Fetching
  }

  pub fn is_paused(&self) -> bool {
    self.fetch_status == FetchStatus::Paused
  }

  pub fn data(&self) -> Option<&Value> {
    self.data.as_deref()
  }

  pub fn error(&self) -> Option<&Error> {
    self.error.as_ref()
  }

  /// Decode the cached payload into `T`.
  pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
    self
      .data()
      .map(|value| {
        T::deserialize(value).map_err(|e| Error::Fetch(format!("Failed to decode data: {}", e)))
      })
      .transpose()
  }

  /// Whether the data is older than `stale_time` or was invalidated.
  pub fn is_stale_after(&self, stale_time: std::time::Duration) -> bool {
    if self.is_invalidated {
      return true;
    }
    match self.data_updated_at {
      None => true,
      // A timestamp in the future (clock skew) counts as fresh
      Some(at) => (Utc::now() - at)
        .to_std()
        .map(|elapsed| elapsed >= stale_time)
        .unwrap_or(false),
    }
  }
}

type Callback = Arc<dyn Fn(&QueryState) + Send + Sync>;

#[derive(Clone)]
struct Listener {
  active: Arc<AtomicBool>,
  callback: Callback,
}

struct InFlight {
  id: u64,
  future: SharedFetch,
  abort: AbortHandle,
  cancel_retry: Arc<AtomicBool>,
  /// State to restore if the fetch is cancelled
  revert_state: QueryState,
  /// Invalidation counter when the fetch started
  invalidations: u64,
}

struct Inner {
  state: QueryState,
  query_fn: Option<QueryFn>,
  in_flight: Option<InFlight>,
  listeners: BTreeMap<u64, Listener>,
  next_listener_id: u64,
  next_fetch_id: u64,
  gc_epoch: u64,
  invalidations: u64,
}

/// One cache entry.
pub struct Query {
  key: QueryKey,
  options: QueryOptions,
  online: OnlineManager,
  cache: Weak<QueryCache>,
  inner: Mutex<Inner>,
}

impl Query {
  pub(crate) fn new(
    key: QueryKey,
    options: QueryOptions,
    online: OnlineManager,
    cache: Weak<QueryCache>,
    state: QueryState,
  ) -> Self {
    Self {
      key,
      options,
      online,
      cache,
      inner: Mutex::new(Inner {
        state,
        query_fn: None,
        in_flight: None,
        listeners: BTreeMap::new(),
        next_listener_id: 0,
        next_fetch_id: 0,
        gc_epoch: 0,
        invalidations: 0,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn options(&self) -> &QueryOptions {
    &self.options
  }

  /// Snapshot of the current state.
  pub fn state(&self) -> QueryState {
    self.lock().state.clone()
  }

  pub fn data(&self) -> Option<Arc<Value>> {
    self.lock().state.data.clone()
  }

  pub fn is_stale(&self) -> bool {
    self.lock().state.is_stale_after(self.options.stale_time)
  }

  pub fn is_fetching(&self) -> bool {
    self.lock().in_flight.is_some()
  }

  pub fn observer_count(&self) -> usize {
    self.lock().listeners.len()
  }

  pub fn has_query_fn(&self) -> bool {
    self.lock().query_fn.is_some()
  }

  /// Replace the function used by later fetches.
  pub fn set_query_fn(&self, query_fn: QueryFn) {
    self.lock().query_fn = Some(query_fn);
  }

  /// Attach `query_fn` and fetch, joining the in-flight fetch if there is one.
  pub fn fetch_with(self: &Arc<Self>, query_fn: QueryFn) -> SharedFetch {
    let mut inner = self.lock();
    inner.query_fn = Some(Arc::clone(&query_fn));
    self.start_fetch(inner, query_fn)
  }

  /// Fetch with the stored query function, joining the in-flight fetch if there is one.
  pub fn fetch(self: &Arc<Self>) -> Result<SharedFetch> {
    let inner = self.lock();
    if let Some(in_flight) = &inner.in_flight {
      return Ok(in_flight.future.clone());
    }
    let query_fn = inner
      .query_fn
      .clone()
      .ok_or_else(|| Error::MissingFetcher(self.key.clone()))?;
    Ok(self.start_fetch(inner, query_fn))
  }

  fn start_fetch(self: &Arc<Self>, mut inner: MutexGuard<'_, Inner>, query_fn: QueryFn) -> SharedFetch {
    if let Some(in_flight) = &inner.in_flight {
      tracing::trace!(key = %self.key, "Joining in-flight fetch");
      return in_flight.future.clone();
    }

    let id = inner.next_fetch_id;
    inner.next_fetch_id += 1;

    let retryer = Retryer::new(self.options.retry, self.online.clone());
    let cancel_retry = retryer.cancel_retry_flag();
    let starts_paused = retryer.starts_paused();

    let query = Arc::clone(self);
    let run = async move {
      let result = retryer.run(&query_fn, query.as_ref()).await;
      query.settle(id, result)
    };
    let (run, abort) = futures::future::abortable(run);
    let future: SharedFetch = run
      .map(|result| result.unwrap_or(Err(Error::Cancelled)))
      .boxed()
      .shared();

    let revert_state = inner.state.clone();
    inner.state.fetch_status = if starts_paused {
      FetchStatus::Paused
    } else {
      FetchStatus::Fetching
    };
    inner.state.failure_count = 0;
    inner.state.failure_reason = None;
    inner.in_flight = Some(InFlight {
      id,
      future: future.clone(),
      abort,
      cancel_retry,
      revert_state,
      invalidations: inner.invalidations,
    });
    inner.gc_epoch += 1;

    let (snapshot, listeners) = Self::snapshot(&inner);
    drop(inner);

    tracing::debug!(key = %self.key, paused = starts_paused, "Starting fetch");
    self.notify(snapshot, listeners);

    // Drive the fetch to completion even if every caller drops its future.
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      handle.spawn(future.clone());
    }

    future
  }

  fn settle(self: &Arc<Self>, id: u64, result: Result<Value>) -> Result<Arc<Value>> {
    let now = Utc::now();
    let mut inner = self.lock();

    let invalidated_during_fetch = match inner.in_flight.take() {
      Some(in_flight) if in_flight.id == id => in_flight.invalidations != inner.invalidations,
      other => {
        inner.in_flight = other;
        inner.state.is_invalidated
      }
    };

    let outcome = match result {
      Ok(value) => {
        let data = Arc::new(value);
        let state = &mut inner.state;
        state.status = QueryStatus::Success;
        state.data = Some(Arc::clone(&data));
        state.data_updated_at = Some(now);
        state.error = None;
        state.failure_count = 0;
        state.failure_reason = None;
        state.is_invalidated = invalidated_during_fetch;
        Ok(data)
      }
      Err(error) => {
        let state = &mut inner.state;
        state.status = QueryStatus::Error;
        state.error = Some(error.clone());
        state.error_updated_at = Some(now);
        Err(error)
      }
    };
    if inner.in_flight.is_none() {
      inner.state.fetch_status = FetchStatus::Idle;
    }

    let unobserved = inner.listeners.is_empty();
    let (snapshot, listeners) = Self::snapshot(&inner);
    drop(inner);

    match &outcome {
      Ok(data) => {
        tracing::debug!(key = %self.key, "Fetch succeeded");
        if let Some(cache) = self.cache.upgrade() {
          cache.persist(&self.key, data, now);
        }
      }
      Err(error) => tracing::warn!(key = %self.key, %error, "Fetch failed"),
    }

    self.notify(snapshot, listeners);
    if unobserved {
      self.schedule_gc();
    }
    outcome
  }

  /// Write data directly, as if a fetch had returned it.
  pub fn set_data(&self, value: Value) -> Arc<Value> {
    let now = Utc::now();
    let data = Arc::new(value);
    let (snapshot, listeners) = {
      let mut inner = self.lock();
      let state = &mut inner.state;
      state.status = QueryStatus::Success;
      state.data = Some(Arc::clone(&data));
      state.data_updated_at = Some(now);
      state.error = None;
      state.is_invalidated = false;
      Self::snapshot(&inner)
    };
    if let Some(cache) = self.cache.upgrade() {
      cache.persist(&self.key, &data, now);
    }
    self.notify(snapshot, listeners);
    data
  }

  /// Mark the data stale so the next access refetches.
  pub fn invalidate(&self) {
    let mut inner = self.lock();
    inner.invalidations += 1;
    if inner.state.is_invalidated {
      return;
    }
    inner.state.is_invalidated = true;
    let (snapshot, listeners) = Self::snapshot(&inner);
    drop(inner);
    self.notify(snapshot, listeners);
  }

  /// Abort the in-flight fetch and restore the state it started from.
  ///
  /// Returns false if nothing was in flight.
  pub fn cancel(self: &Arc<Self>) -> bool {
    let mut inner = self.lock();
    let Some(in_flight) = inner.in_flight.take() else {
      return false;
    };
    in_flight.abort.abort();
    let current = std::mem::take(&mut inner.state);
    let mut state = QueryState {
      fetch_status: FetchStatus::Idle,
      ..in_flight.revert_state
    };
    // Keep writes that landed while the fetch was running.
    if current.data_updated_at != state.data_updated_at {
      state.status = current.status;
      state.data = current.data;
      state.data_updated_at = current.data_updated_at;
      state.error = current.error;
      state.is_invalidated = current.is_invalidated;
    } else if in_flight.invalidations != inner.invalidations {
      state.is_invalidated = true;
    }
    inner.state = state;
    let unobserved = inner.listeners.is_empty();
    let (snapshot, listeners) = Self::snapshot(&inner);
    drop(inner);

    tracing::debug!(key = %self.key, "Fetch cancelled");
    self.notify(snapshot, listeners);
    if unobserved {
      self.schedule_gc();
    }
    true
  }

  /// Register a callback for every state transition.
  ///
  /// The callback runs immediately with the current state. Notifications stop
  /// when the returned [`Subscription`] is released or dropped.
  pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
  where
    F: Fn(&QueryState) + Send + Sync + 'static,
  {
    let active = Arc::new(AtomicBool::new(true));
    let callback: Callback = Arc::new(callback);

    let (id, snapshot) = {
      let mut inner = self.lock();
      let id = inner.next_listener_id;
      inner.next_listener_id += 1;
      inner.listeners.insert(
        id,
        Listener {
          active: Arc::clone(&active),
          callback: Arc::clone(&callback),
        },
      );
      inner.gc_epoch += 1;
      if let Some(in_flight) = &inner.in_flight {
        in_flight.cancel_retry.store(false, Ordering::SeqCst);
      }
      (id, inner.state.clone())
    };

    callback(&snapshot);

    Subscription {
      query: Arc::downgrade(self),
      id,
      active,
    }
  }

  fn unsubscribe(self: &Arc<Self>, id: u64) {
    let now_unobserved = {
      let mut inner = self.lock();
      let removed = inner.listeners.remove(&id).is_some();
      let now_unobserved = removed && inner.listeners.is_empty();
      if now_unobserved {
        if let Some(in_flight) = &inner.in_flight {
          tracing::debug!(key = %self.key, "Last observer left, no further retries");
          in_flight.cancel_retry.store(true, Ordering::SeqCst);
        }
      }
      now_unobserved
    };
    if now_unobserved {
      self.schedule_gc();
    }
  }

  /// Evict this entry after `gc_time` unless it is observed or fetched again meanwhile.
  pub(crate) fn schedule_gc(self: &Arc<Self>) {
    let epoch = {
      let mut inner = self.lock();
      inner.gc_epoch += 1;
      inner.gc_epoch
    };
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let gc_time = self.options.gc_time;
    let query = Arc::downgrade(self);
    handle.spawn(async move {
      tokio::time::sleep(gc_time).await;
      if let Some(query) = query.upgrade() {
        if let Some(cache) = query.cache.upgrade() {
          cache.collect(&query, epoch);
        }
      }
    });
  }

  pub(crate) fn is_collectable(&self, epoch: u64) -> bool {
    let inner = self.lock();
    inner.gc_epoch == epoch && inner.listeners.is_empty() && inner.in_flight.is_none()
  }

  fn update(&self, f: impl FnOnce(&mut QueryState)) {
    let (snapshot, listeners) = {
      let mut inner = self.lock();
      f(&mut inner.state);
      Self::snapshot(&inner)
    };
    self.notify(snapshot, listeners);
  }

  fn snapshot(inner: &Inner) -> (QueryState, Vec<Listener>) {
    (
      inner.state.clone(),
      inner.listeners.values().cloned().collect(),
    )
  }

  /// Deliver a state snapshot outside the lock so callbacks may call back in.
  fn notify(&self, snapshot: QueryState, listeners: Vec<Listener>) {
    for listener in &listeners {
      if listener.active.load(Ordering::SeqCst) {
        (listener.callback)(&snapshot);
      }
    }
    if let Some(cache) = self.cache.upgrade() {
      cache.emit(CacheEvent::Updated(self.key.clone(), snapshot));
    }
  }
}

impl RetryHooks for Query {
  fn on_pause(&self) {
    tracing::debug!(key = %self.key, "Offline, pausing fetch");
    self.update(|state| state.fetch_status = FetchStatus::Paused);
  }

  fn on_continue(&self) {
    self.update(|state| state.fetch_status = FetchStatus::Fetching);
  }

  fn on_failure(&self, failure_count: u32, error: &Error) {
    let error = error.clone();
    self.update(|state| {
      state.failure_count = failure_count;
      state.failure_reason = Some(error);
    });
  }
}

impl std::fmt::Debug for Query {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state())
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

/// Handle for a registered callback. Dropping it releases the registration.
#[must_use = "dropping a Subscription immediately stops notifications"]
pub struct Subscription {
  query: Weak<Query>,
  id: u64,
  active: Arc<AtomicBool>,
}

impl Subscription {
  /// Stop notifications. Equivalent to dropping the handle.
  pub fn release(self) {}

  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::SeqCst)
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.active.store(false, Ordering::SeqCst);
    if let Some(query) = self.query.upgrade() {
      query.unsubscribe(self.id);
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .field("active", &self.is_active())
      .finish()
  }
}

//! `QueryClient`: the context object handed to every consumer.

use serde_json::Value;
use std::sync::Arc;

use crate::cache::{CacheStorage, NoopStorage, QueryCache};
use crate::config::{DefaultOptions, MutationOptions, QueryOptions};
use crate::error::{Error, Result};
use crate::event::{EventBus, EventStream};
use crate::key::QueryKey;
use crate::mutation::{Mutation, MutationCache};
use crate::online::OnlineManager;
use crate::query::{Query, QueryFn, QueryState, Subscription};

/// Follow-up behaviour for a mutation.
#[derive(Debug, Clone, Default)]
pub struct MutateOptions {
  /// Query key prefixes invalidated once the mutation succeeds
  pub invalidates: Vec<QueryKey>,
}

/// Builder for a [`QueryClient`].
pub struct QueryClientBuilder {
  defaults: DefaultOptions,
  online: OnlineManager,
  storage: Arc<dyn CacheStorage>,
}

impl QueryClientBuilder {
  pub fn defaults(mut self, defaults: DefaultOptions) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn online_manager(mut self, online: OnlineManager) -> Self {
    self.online = online;
    self
  }

  /// Persist successful query results and hydrate new entries from `storage`.
  pub fn storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
    self.storage = storage;
    self
  }

  pub fn build(self) -> Result<QueryClient> {
    self.defaults.validate()?;

    let events = EventBus::default();
    let queries = QueryCache::new(
      QueryOptions::from(&self.defaults.queries),
      self.online.clone(),
      self.storage,
      events.clone(),
    );
    let mutations = MutationCache::new(
      MutationOptions::from(&self.defaults.mutations),
      self.online.clone(),
      events.clone(),
    );

    tracing::debug!(
      queries = ?self.defaults.queries.network_mode,
      mutations = ?self.defaults.mutations.network_mode,
      "Query client configured"
    );

    Ok(QueryClient {
      inner: Arc::new(ClientInner {
        defaults: self.defaults,
        queries,
        mutations,
        online: self.online,
        events,
      }),
    })
  }
}

struct ClientInner {
  defaults: DefaultOptions,
  queries: Arc<QueryCache>,
  mutations: Arc<MutationCache>,
  online: OnlineManager,
  events: EventBus,
}

/// Shared registry of queries and mutations.
///
/// Cloning is cheap and every clone addresses the same registry. The policy
/// passed at construction applies to every entry and cannot be changed later.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<ClientInner>,
}

impl QueryClient {
  pub fn builder() -> QueryClientBuilder {
    QueryClientBuilder {
      defaults: DefaultOptions::default(),
      online: OnlineManager::default(),
      storage: Arc::new(NoopStorage),
    }
  }

  pub fn new(defaults: DefaultOptions) -> Result<Self> {
    Self::builder().defaults(defaults).build()
  }

  /// Build a client from a YAML/JSON policy document.
  ///
  /// Unknown options and invalid values fail with [`Error::Configuration`].
  pub fn configure(source: &str) -> Result<Self> {
    Self::new(DefaultOptions::from_yaml(source)?)
  }

  pub fn defaults(&self) -> &DefaultOptions {
    &self.inner.defaults
  }

  pub fn online_manager(&self) -> &OnlineManager {
    &self.inner.online
  }

  pub fn query_cache(&self) -> &Arc<QueryCache> {
    &self.inner.queries
  }

  pub fn mutation_cache(&self) -> &Arc<MutationCache> {
    &self.inner.mutations
  }

  /// Return the entry for `key`, creating a pending one if needed.
  pub fn get_or_create(&self, key: impl Into<QueryKey>) -> Arc<Query> {
    self.inner.queries.get_or_create(&key.into())
  }

  pub fn get(&self, key: impl Into<QueryKey>) -> Option<Arc<Query>> {
    self.inner.queries.get(&key.into())
  }

  pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
    self.get(key).map(|query| query.state())
  }

  pub fn get_query_data(&self, key: impl Into<QueryKey>) -> Option<Arc<Value>> {
    self.get(key).and_then(|query| query.data())
  }

  pub fn set_query_data(&self, key: impl Into<QueryKey>, value: Value) -> Arc<Value> {
    self.get_or_create(key).set_data(value)
  }

  /// Return fresh cached data, or fetch it (joining any in-flight fetch).
  pub async fn fetch_query(&self, key: impl Into<QueryKey>, query_fn: QueryFn) -> Result<Arc<Value>> {
    let query = self.get_or_create(key);
    if !query.is_stale() {
      if let Some(data) = query.data() {
        query.set_query_fn(query_fn);
        return Ok(data);
      }
    }
    query.fetch_with(query_fn).await
  }

  /// Start fetching stale data in the background.
  pub fn prefetch_query(&self, key: impl Into<QueryKey>, query_fn: QueryFn) {
    let query = self.get_or_create(key);
    if query.is_stale() {
      drop(query.fetch_with(query_fn));
    } else {
      query.set_query_fn(query_fn);
    }
  }

  /// Refetch an existing entry with its stored query function.
  pub async fn refetch(&self, key: impl Into<QueryKey>) -> Result<Arc<Value>> {
    let key = key.into();
    let query = self
      .inner
      .queries
      .get(&key)
      .ok_or(Error::NotFound(key))?;
    query.fetch()?.await
  }

  /// Mark entries under `prefix` stale. Returns how many matched; zero is not an error.
  pub fn invalidate(&self, prefix: impl Into<QueryKey>) -> usize {
    invalidate_matching(&self.inner.queries, &prefix.into())
  }

  /// Register `callback` for state transitions of `key`.
  ///
  /// The callback receives the current state immediately. A stale entry with a
  /// known query function is refetched in the background.
  pub fn subscribe<F>(&self, key: impl Into<QueryKey>, callback: F) -> Subscription
  where
    F: Fn(&QueryState) + Send + Sync + 'static,
  {
    let query = self.get_or_create(key);
    let subscription = query.subscribe(callback);
    self.refetch_on_access(&query);
    subscription
  }

  fn refetch_on_access(&self, query: &Arc<Query>) {
    if !query.has_query_fn() || query.is_fetching() || !query.is_stale() {
      return;
    }
    if tokio::runtime::Handle::try_current().is_err() {
      return;
    }
    tracing::debug!(key = %query.key(), "Stale on access, refetching");
    if let Ok(future) = query.fetch() {
      drop(future);
    }
  }

  /// Hard-cancel in-flight fetches under `prefix`. Returns how many were cancelled.
  pub fn cancel(&self, prefix: impl Into<QueryKey>) -> usize {
    self
      .inner
      .queries
      .find_all(&prefix.into())
      .iter()
      .filter(|query| query.cancel())
      .count()
  }

  /// Remove entries under `prefix`. Returns how many were removed.
  pub fn remove(&self, prefix: impl Into<QueryKey>) -> usize {
    self.inner.queries.remove(&prefix.into())
  }

  /// Drop every query and mutation.
  pub fn clear(&self) {
    self.inner.queries.remove(&QueryKey::default());
    self.inner.mutations.clear();
  }

  /// Number of entries with a fetch in flight.
  pub fn is_fetching(&self) -> usize {
    self
      .inner
      .queries
      .find_all(&QueryKey::default())
      .iter()
      .filter(|query| query.is_fetching())
      .count()
  }

  /// Run a write operation under the mutation defaults.
  pub fn mutate(&self, operation: QueryFn) -> Arc<Mutation> {
    self.mutate_with(operation, MutateOptions::default())
  }

  pub fn mutate_with(&self, operation: QueryFn, options: MutateOptions) -> Arc<Mutation> {
    let queries = Arc::clone(&self.inner.queries);
    self.inner.mutations.execute(operation, move || {
      for prefix in &options.invalidates {
        invalidate_matching(&queries, prefix);
      }
    })
  }

  /// Number of mutations that have not settled.
  pub fn is_mutating(&self) -> usize {
    self.inner.mutations.pending_count()
  }

  /// Stream of cache-level events.
  pub fn events(&self) -> EventStream {
    self.inner.events.subscribe()
  }
}

fn invalidate_matching(queries: &QueryCache, prefix: &QueryKey) -> usize {
  let matches = queries.find_all(prefix);
  for query in &matches {
    query.invalidate();
  }
  tracing::debug!(prefix = %prefix, count = matches.len(), "Invalidated queries");
  matches.len()
}

impl std::fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryClient")
      .field("defaults", &self.inner.defaults)
      .field("queries", &self.inner.queries.len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::NetworkMode;
  use crate::event::CacheEvent;
  use crate::query::{query_fn, FetchStatus, QueryStatus};
  use crate::query_key;
  use crate::test_support::{connectivity_fn, counting_fn, failing_fn, recorder};
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn client(policy: &str) -> QueryClient {
    QueryClient::configure(policy).unwrap()
  }

  #[test]
  fn test_configure_rejects_unknown_option() {
    let err = QueryClient::configure("queries: { networkMode: always, cacheTime: 5 }").unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
  }

  #[test]
  fn test_policy_applies_to_every_entry() {
    let client = client("queries: { networkMode: offline-first }");
    let a = client.get_or_create(query_key!["a"]);
    let b = client.get_or_create(query_key!["b", 1]);
    assert_eq!(a.options().retry.network_mode, NetworkMode::OfflineFirst);
    assert_eq!(b.options(), a.options());
  }

  #[test]
  fn test_get_or_create_dedupes_structurally() {
    let client = client("{}");
    let a = client.get_or_create(query_key!["user", 42]);
    let b = client.get_or_create(vec!["user".into(), crate::key::KeyPart::Int(42)]);
    let c = client.get_or_create(query_key!["user", 7]);

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(a.state().status, QueryStatus::Pending);
  }

  #[test]
  fn test_invalidate_unknown_key_is_noop() {
    let client = client("{}");
    assert_eq!(client.invalidate(query_key!["never", "registered"]), 0);
    assert!(client.get(query_key!["never", "registered"]).is_none());
  }

  #[tokio::test]
  async fn test_successful_fetch_stores_payload() {
    let client = client("queries: { retry: 0 }");
    let calls = Arc::new(AtomicU32::new(0));
    let payload = serde_json::json!({"id": 42, "name": "Ada"});

    let data = client
      .fetch_query(query_key!["user", 42], counting_fn(calls, payload.clone()))
      .await
      .unwrap();

    assert_eq!(*data, payload);
    let state = client.get_query_state(query_key!["user", 42]).unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data(), Some(&payload));
  }

  #[tokio::test]
  async fn test_concurrent_fetch_query_calls_coalesce() {
    let client = client("queries: { retry: 0 }");
    let calls = Arc::new(AtomicU32::new(0));
    let slow = {
      let calls = calls.clone();
      query_fn(move || {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(20)).await;
          Ok(serde_json::json!("profile"))
        }
      })
    };

    let results = futures::future::join_all(
      (0..5).map(|_| client.fetch_query(query_key!["user", 42], slow.clone())),
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.as_ref().unwrap().as_str() == Some("profile")));
  }

  #[tokio::test]
  async fn test_distinct_keys_fetch_independently() {
    let client = client("queries: { retry: 0 }");
    let calls = Arc::new(AtomicU32::new(0));

    let (a, b) = futures::join!(
      client.fetch_query(query_key!["user", 1], counting_fn(calls.clone(), serde_json::json!(1))),
      client.fetch_query(query_key!["user", 2], counting_fn(calls.clone(), serde_json::json!(2))),
    );
    assert_eq!(*a.unwrap(), serde_json::json!(1));
    assert_eq!(*b.unwrap(), serde_json::json!(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_fresh_data_is_served_from_cache() {
    let client = client("queries: { retry: 0, staleTime: 60000 }");
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
      client
        .fetch_query(query_key!["todos"], counting_fn(calls.clone(), serde_json::json!([])))
        .await
        .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failed_fetch_keeps_entry_and_data() {
    let client = client("queries: { retry: 0, staleTime: 60000 }");
    let key = query_key!["user", 42];
    client.set_query_data(key.clone(), serde_json::json!({"id": 42}));
    client.invalidate(key.clone());

    let err = client
      .fetch_query(key.clone(), failing_fn(Error::Network("down".to_string())))
      .await
      .unwrap_err();
    assert!(err.is_network());

    let state = client.get_query_state(key.clone()).unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.data(), Some(&serde_json::json!({"id": 42})));

    let (seen, callback) = recorder();
    let _sub = client.subscribe(key, callback);
    let first = seen.lock().unwrap()[0].clone();
    assert_eq!(first.status, QueryStatus::Error);
    assert_eq!(first.error, Some(err));
  }

  #[tokio::test]
  async fn test_always_mode_surfaces_network_error_while_offline() {
    let online = OnlineManager::new(false);
    let client = QueryClient::builder()
      .defaults(DefaultOptions::from_yaml("queries: { networkMode: always, retry: 0 }").unwrap())
      .online_manager(online.clone())
      .build()
      .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let result = client
      .fetch_query(
        query_key!["user", 42],
        connectivity_fn(online, calls.clone(), serde_json::json!({})),
      )
      .await;

    assert!(matches!(result, Err(Error::Network(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let state = client.get_query_state(query_key!["user", 42]).unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert!(matches!(state.error, Some(Error::Network(_))));
  }

  #[tokio::test]
  async fn test_online_only_mode_waits_for_connectivity() {
    let online = OnlineManager::new(false);
    let client = QueryClient::builder()
      .defaults(DefaultOptions::from_yaml("queries: { networkMode: online-only, retry: 0 }").unwrap())
      .online_manager(online.clone())
      .build()
      .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    client.prefetch_query(
      query_key!["user", 42],
      connectivity_fn(online.clone(), calls.clone(), serde_json::json!("ok")),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    let state = client.get_query_state(query_key!["user", 42]).unwrap();
    assert_eq!(state.fetch_status, FetchStatus::Paused);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    online.set_online(true);
    let data = client.refetch(query_key!["user", 42]).await.unwrap();
    assert_eq!(*data, serde_json::json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidate_refetches_on_next_subscribe() {
    let client = client("queries: { retry: 0, staleTime: 60000 }");
    let calls = Arc::new(AtomicU32::new(0));
    let fetch = counting_fn(calls.clone(), serde_json::json!("v"));

    client.fetch_query(query_key!["todos", 1], fetch.clone()).await.unwrap();
    client.fetch_query(query_key!["todos", 2], fetch).await.unwrap();

    let sub = client.subscribe(query_key!["todos", 1], |_| {});
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    drop(sub);

    assert_eq!(client.invalidate(query_key!["todos"]), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let _sub = client.subscribe(query_key!["todos", 1], |_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!client.get(query_key!["todos", 1]).unwrap().is_stale());
    assert!(client.get(query_key!["todos", 2]).unwrap().is_stale());
  }

  #[tokio::test]
  async fn test_refetch_errors() {
    let client = client("{}");
    assert_eq!(
      client.refetch(query_key!["nope"]).await.unwrap_err(),
      Error::NotFound(query_key!["nope"])
    );

    client.get_or_create(query_key!["bare"]);
    assert_eq!(
      client.refetch(query_key!["bare"]).await.unwrap_err(),
      Error::MissingFetcher(query_key!["bare"])
    );
  }

  #[tokio::test]
  async fn test_cancel_and_remove() {
    let client = client("queries: { retry: 0 }");
    let never = query_fn(|| async {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(Value::Null)
    });
    client.prefetch_query(query_key!["slow", 1], never.clone());
    client.prefetch_query(query_key!["slow", 2], never);
    assert_eq!(client.is_fetching(), 2);

    assert_eq!(client.cancel(query_key!["slow"]), 2);
    assert_eq!(client.is_fetching(), 0);
    assert!(client.get_query_state(query_key!["slow", 1]).unwrap().is_pending());

    assert_eq!(client.remove(query_key!["slow", 1]), 1);
    assert!(client.get(query_key!["slow", 1]).is_none());
    client.clear();
    assert_eq!(client.query_cache().len(), 0);
  }

  #[tokio::test]
  async fn test_mutation_invalidates_queries() {
    let client = client("queries: { staleTime: 60000 }");
    client.set_query_data(query_key!["todos"], serde_json::json!([]));
    assert!(!client.get(query_key!["todos"]).unwrap().is_stale());

    let mutation = client.mutate_with(
      query_fn(|| async { Ok(serde_json::json!({"id": 1})) }),
      MutateOptions {
        invalidates: vec![query_key!["todos"]],
      },
    );
    mutation.wait().await.unwrap();

    assert!(client.get(query_key!["todos"]).unwrap().is_stale());
    assert_eq!(client.is_mutating(), 0);
  }

  #[tokio::test]
  async fn test_mutate_reports_transport_errors() {
    let client = client("mutations: { networkMode: always }");
    let mutation = client.mutate(failing_fn(Error::Network("offline".to_string())));
    assert!(mutation.wait().await.unwrap_err().is_network());
  }

  #[tokio::test]
  async fn test_persisted_results_hydrate_new_client() {
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let first = QueryClient::builder().storage(storage.clone()).build().unwrap();
    first
      .fetch_query(
        query_key!["user", 42],
        counting_fn(Arc::new(AtomicU32::new(0)), serde_json::json!({"id": 42})),
      )
      .await
      .unwrap();

    let second = QueryClient::builder().storage(storage).build().unwrap();
    assert!(second.get_query_data(query_key!["user", 42]).is_none());
    let hydrated = second.get_or_create(query_key!["user", 42]).state();
    assert!(hydrated.is_success());
    assert_eq!(hydrated.data(), Some(&serde_json::json!({"id": 42})));
  }

  #[tokio::test]
  async fn test_events_report_entry_lifecycle() {
    let client = client("queries: { retry: 0 }");
    let mut events = client.events();

    client
      .fetch_query(
        query_key!["todos"],
        counting_fn(Arc::new(AtomicU32::new(0)), serde_json::json!([])),
      )
      .await
      .unwrap();
    client.remove(query_key!["todos"]);

    let mut seen = Vec::new();
    while let Some(event) = events.try_next() {
      seen.push(event);
    }
    assert!(matches!(seen.first(), Some(CacheEvent::Added(_))));
    assert!(seen
      .iter()
      .any(|e| matches!(e, CacheEvent::Updated(_, s) if s.is_success())));
    assert!(matches!(seen.last(), Some(CacheEvent::Removed(_))));
  }
}

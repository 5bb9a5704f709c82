//! Query registry and persistence.
//!
//! The registry holds at most one [`Query`] per structurally distinct key.
//! Entries are created on first access, hydrated from the configured storage
//! backend when it holds a value, and evicted once they have been unobserved
//! for their `gc_time`.

mod storage;

pub use storage::{CacheStorage, NoopStorage, PersistedQuery, SqliteStorage};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::config::QueryOptions;
use crate::event::{CacheEvent, EventBus};
use crate::key::QueryKey;
use crate::online::OnlineManager;
use crate::query::{Query, QueryState};

/// Registry mapping query keys to entries.
pub struct QueryCache {
  queries: Mutex<HashMap<QueryKey, Arc<Query>>>,
  options: QueryOptions,
  online: OnlineManager,
  storage: Arc<dyn CacheStorage>,
  events: EventBus,
  this: Weak<QueryCache>,
}

impl QueryCache {
  pub(crate) fn new(
    options: QueryOptions,
    online: OnlineManager,
    storage: Arc<dyn CacheStorage>,
    events: EventBus,
  ) -> Arc<Self> {
    Arc::new_cyclic(|this| Self {
      queries: Mutex::new(HashMap::new()),
      options,
      online,
      storage,
      events,
      this: this.clone(),
    })
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, Arc<Query>>> {
    self.queries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Return the entry for `key`, creating it if needed.
  pub fn get_or_create(&self, key: &QueryKey) -> Arc<Query> {
    if let Some(query) = self.get(key) {
      return query;
    }

    // Storage is read without holding the registry lock.
    let state = self.hydrate(key);

    let created = {
      let mut queries = self.lock();
      if let Some(query) = queries.get(key) {
        return Arc::clone(query);
      }

      let query = Arc::new(Query::new(
        key.clone(),
        self.options,
        self.online.clone(),
        self.this.clone(),
        state,
      ));
      queries.insert(key.clone(), Arc::clone(&query));
      query
    };

    tracing::trace!(key = %key, "Query entry created");
    self.events.emit(CacheEvent::Added(key.clone()));
    created.schedule_gc();
    created
  }

  pub fn get(&self, key: &QueryKey) -> Option<Arc<Query>> {
    self.lock().get(key).cloned()
  }

  /// Entries whose key starts with `prefix`.
  pub fn find_all(&self, prefix: &QueryKey) -> Vec<Arc<Query>> {
    self
      .lock()
      .values()
      .filter(|query| query.key().starts_with(prefix))
      .cloned()
      .collect()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Remove entries matching `prefix` from the registry and the storage backend.
  pub fn remove(&self, prefix: &QueryKey) -> usize {
    let removed: Vec<Arc<Query>> = {
      let mut queries = self.lock();
      let keys: Vec<QueryKey> = queries
        .keys()
        .filter(|key| key.starts_with(prefix))
        .cloned()
        .collect();
      keys.iter().filter_map(|key| queries.remove(key)).collect()
    };

    for query in &removed {
      query.cancel();
      if let Err(error) = self.storage.remove(query.key()) {
        tracing::warn!(key = %query.key(), %error, "Failed to remove persisted query");
      }
      self.events.emit(CacheEvent::Removed(query.key().clone()));
    }
    removed.len()
  }

  /// Evict `query` if nothing touched it since the collection was scheduled.
  pub(crate) fn collect(&self, query: &Arc<Query>, epoch: u64) {
    let removed = {
      let mut queries = self.lock();
      let current = queries
        .get(query.key())
        .map(|q| Arc::ptr_eq(q, query))
        .unwrap_or(false);
      current && query.is_collectable(epoch) && queries.remove(query.key()).is_some()
    };
    if removed {
      tracing::debug!(key = %query.key(), "Evicted unobserved query");
      self.events.emit(CacheEvent::Removed(query.key().clone()));
    }
  }

  fn hydrate(&self, key: &QueryKey) -> QueryState {
    match self.storage.load(key) {
      Ok(Some(persisted)) => {
        tracing::debug!(key = %key, "Hydrated query from storage");
        QueryState::hydrated(persisted.data, persisted.updated_at)
      }
      Ok(None) => QueryState::default(),
      Err(error) => {
        tracing::warn!(key = %key, %error, "Failed to load persisted query");
        QueryState::default()
      }
    }
  }

  pub(crate) fn persist(&self, key: &QueryKey, data: &Value, updated_at: DateTime<Utc>) {
    if let Err(error) = self.storage.store(key, data, updated_at) {
      tracing::warn!(key = %key, %error, "Failed to persist query");
    }
  }

  pub(crate) fn emit(&self, event: CacheEvent) {
    self.events.emit(event);
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }
}

//! Mutation entries: write-style operations that are tracked but never cached by key.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;

use crate::config::MutationOptions;
use crate::error::{Error, Result};
use crate::event::{CacheEvent, EventBus};
use crate::online::OnlineManager;
use crate::query::QueryFn;
use crate::retryer::{RetryHooks, Retryer};

/// Progress of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Idle,
  Pending,
  Success,
  Error,
}

/// Snapshot of a mutation entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationState {
  pub status: MutationStatus,
  pub data: Option<Arc<Value>>,
  pub error: Option<Error>,
  pub failure_count: u32,
  /// Waiting for connectivity
  pub is_paused: bool,
  pub submitted_at: Option<DateTime<Utc>>,
}

impl Default for MutationState {
  fn default() -> Self {
    Self {
      status: MutationStatus::Idle,
      data: None,
      error: None,
      failure_count: 0,
      is_paused: false,
      submitted_at: None,
    }
  }
}

impl MutationState {
  pub fn is_settled(&self) -> bool {
    matches!(self.status, MutationStatus::Success | MutationStatus::Error)
  }
}

/// One mutation entry.
#[derive(Debug)]
pub struct Mutation {
  id: u64,
  options: MutationOptions,
  state: watch::Sender<MutationState>,
  events: EventBus,
}

impl Mutation {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn options(&self) -> &MutationOptions {
    &self.options
  }

  pub fn state(&self) -> MutationState {
    self.state.borrow().clone()
  }

  /// Receiver that observes every state change.
  pub fn watch(&self) -> watch::Receiver<MutationState> {
    self.state.subscribe()
  }

  /// Wait until the mutation settles and return its outcome.
  pub async fn wait(&self) -> Result<Arc<Value>> {
    let mut rx = self.state.subscribe();
    let state = rx
      .wait_for(MutationState::is_settled)
      .await
      .map_err(|_| Error::Cancelled)?
      .clone();
    match (state.data, state.error) {
      (_, Some(error)) => Err(error),
      (Some(data), None) => Ok(data),
      (None, None) => Err(Error::Cancelled),
    }
  }

  fn update(&self, f: impl FnOnce(&mut MutationState)) {
    self.state.send_modify(f);
    self
      .events
      .emit(CacheEvent::MutationUpdated(self.id, self.state()));
  }
}

impl RetryHooks for Mutation {
  fn on_pause(&self) {
    self.update(|state| state.is_paused = true);
  }

  fn on_continue(&self) {
    self.update(|state| state.is_paused = false);
  }

  fn on_failure(&self, failure_count: u32, _error: &Error) {
    self.update(|state| state.failure_count = failure_count);
  }
}

/// Registry of mutations that are running or settled within their `gc_time`.
pub struct MutationCache {
  mutations: Mutex<Vec<Arc<Mutation>>>,
  options: MutationOptions,
  online: OnlineManager,
  events: EventBus,
  next_id: AtomicU64,
  this: Weak<MutationCache>,
}

impl MutationCache {
  pub(crate) fn new(options: MutationOptions, online: OnlineManager, events: EventBus) -> Arc<Self> {
    Arc::new_cyclic(|this| Self {
      mutations: Mutex::new(Vec::new()),
      options,
      online,
      events,
      next_id: AtomicU64::new(0),
      this: this.clone(),
    })
  }

  /// Start `operation` and return its entry immediately.
  ///
  /// `on_success` runs before the success state is published to waiters.
  pub(crate) fn execute(
    &self,
    operation: QueryFn,
    on_success: impl FnOnce() + Send + 'static,
  ) -> Arc<Mutation> {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let mutation = Arc::new(Mutation {
      id,
      options: self.options,
      state: watch::channel(MutationState::default()).0,
      events: self.events.clone(),
    });
    self
      .mutations
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(Arc::clone(&mutation));

    let retryer = Retryer::new(self.options.retry, self.online.clone());
    let paused = retryer.starts_paused();
    mutation.update(|state| {
      state.status = MutationStatus::Pending;
      state.is_paused = paused;
      state.submitted_at = Some(Utc::now());
    });
    tracing::debug!(id, paused, "Mutation submitted");

    let task = {
      let mutation = Arc::clone(&mutation);
      let cache = self.this.clone();
      async move {
        let result = retryer.run(&operation, mutation.as_ref()).await;
        match result {
          Ok(value) => {
            let data = Arc::new(value);
            // Runs before the success state is published
            on_success();
            mutation.update(|state| {
              state.status = MutationStatus::Success;
              state.data = Some(data);
              state.error = None;
              state.is_paused = false;
            });
            tracing::debug!(id = mutation.id, "Mutation succeeded");
          }
          Err(error) => {
            tracing::warn!(id = mutation.id, %error, "Mutation failed");
            mutation.update(|state| {
              state.status = MutationStatus::Error;
              state.error = Some(error);
              state.is_paused = false;
            });
          }
        }
        if let Some(cache) = cache.upgrade() {
          cache.schedule_gc(&mutation);
        }
      }
    };

    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(task);
      }
      Err(_) => {
        tracing::error!(id, "No async runtime available to run mutation");
        mutation.update(|state| {
          state.status = MutationStatus::Error;
          state.error = Some(Error::Cancelled);
        });
      }
    }

    mutation
  }

  fn schedule_gc(&self, mutation: &Arc<Mutation>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let gc_time = self.options.gc_time;
    let cache = self.this.clone();
    let id = mutation.id;
    handle.spawn(async move {
      tokio::time::sleep(gc_time).await;
      if let Some(cache) = cache.upgrade() {
        cache
          .mutations
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .retain(|m| m.id != id);
      }
    });
  }

  pub fn get(&self, id: u64) -> Option<Arc<Mutation>> {
    self
      .mutations
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .find(|m| m.id == id)
      .cloned()
  }

  pub fn all(&self) -> Vec<Arc<Mutation>> {
    self
      .mutations
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Number of mutations that have not settled yet.
  pub fn pending_count(&self) -> usize {
    self
      .mutations
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .filter(|m| !m.state().is_settled())
      .count()
  }

  pub fn clear(&self) {
    self
      .mutations
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{MutationDefaults, NetworkMode};
  use crate::query::query_fn;
  use std::sync::atomic::{AtomicBool, AtomicU32};
  use std::time::Duration;

  fn cache(defaults: MutationDefaults, online: OnlineManager) -> Arc<MutationCache> {
    MutationCache::new(MutationOptions::from(&defaults), online, EventBus::default())
  }

  #[tokio::test]
  async fn test_mutation_success() {
    let mutations = cache(MutationDefaults::default(), OnlineManager::default());
    let ran_hook = Arc::new(AtomicBool::new(false));

    let mutation = {
      let ran_hook = ran_hook.clone();
      mutations.execute(
        query_fn(|| async { Ok(serde_json::json!({"saved": true})) }),
        move || ran_hook.store(true, Ordering::SeqCst),
      )
    };
    assert_eq!(mutation.state().status, MutationStatus::Pending);

    let data = mutation.wait().await.unwrap();
    assert_eq!(*data, serde_json::json!({"saved": true}));
    assert_eq!(mutation.state().status, MutationStatus::Success);
    assert!(ran_hook.load(Ordering::SeqCst));
    assert_eq!(mutations.pending_count(), 0);
    assert!(mutations.get(mutation.id()).is_some());
  }

  #[tokio::test]
  async fn test_mutation_error_skips_hook() {
    let mutations = cache(MutationDefaults::default(), OnlineManager::default());
    let ran_hook = Arc::new(AtomicBool::new(false));

    let mutation = {
      let ran_hook = ran_hook.clone();
      mutations.execute(
        query_fn(|| async { Err(Error::Fetch("HTTP 409".to_string())) }),
        move || ran_hook.store(true, Ordering::SeqCst),
      )
    };

    let err = mutation.wait().await.unwrap_err();
    assert_eq!(err, Error::Fetch("HTTP 409".to_string()));
    assert_eq!(mutation.state().failure_count, 1);
    assert!(!ran_hook.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn test_mutations_do_not_retry_by_default() {
    let mutations = cache(MutationDefaults::default(), OnlineManager::default());
    let calls = Arc::new(AtomicU32::new(0));
    let mutation = {
      let calls = calls.clone();
      mutations.execute(
        query_fn(move || {
          let calls = calls.clone();
          async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Network("reset".to_string()))
          }
        }),
        || {},
      )
    };

    assert!(mutation.wait().await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_online_only_mutation_pauses() {
    let online = OnlineManager::new(false);
    let mutations = cache(
      MutationDefaults {
        network_mode: NetworkMode::OnlineOnly,
        ..MutationDefaults::default()
      },
      online.clone(),
    );

    let mutation = mutations.execute(query_fn(|| async { Ok(Value::Null) }), || {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(mutation.state().is_paused);
    assert_eq!(mutations.pending_count(), 1);

    online.set_online(true);
    mutation.wait().await.unwrap();
    assert!(!mutation.state().is_paused);
  }

  #[tokio::test]
  async fn test_settled_mutation_is_collected() {
    let mutations = cache(
      MutationDefaults {
        gc_time: 10,
        ..MutationDefaults::default()
      },
      OnlineManager::default(),
    );
    let mutation = mutations.execute(query_fn(|| async { Ok(Value::Null) }), || {});
    mutation.wait().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(mutations.all().is_empty());
  }
}

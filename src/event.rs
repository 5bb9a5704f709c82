use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::key::QueryKey;
use crate::mutation::MutationState;
use crate::query::QueryState;

/// Cache-level events
#[derive(Debug, Clone)]
pub enum CacheEvent {
  /// A query entry was created
  Added(QueryKey),
  /// A query entry changed state
  Updated(QueryKey, QueryState),
  /// A query entry was evicted or removed
  Removed(QueryKey),
  /// A mutation changed state
  MutationUpdated(u64, MutationState),
}

/// Fan-out of cache events to every open [`EventStream`].
#[derive(Debug, Clone, Default)]
pub(crate) struct EventBus {
  senders: Arc<Mutex<Vec<mpsc::UnboundedSender<CacheEvent>>>>,
}

impl EventBus {
  pub fn subscribe(&self) -> EventStream {
    let (tx, rx) = mpsc::unbounded_channel();
    self
      .senders
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(tx);
    EventStream { rx }
  }

  pub fn emit(&self, event: CacheEvent) {
    let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
    if senders.is_empty() {
      return;
    }
    // Closed streams are dropped on the next emit
    senders.retain(|tx| tx.send(event.clone()).is_ok());
  }
}

/// Receiving end of the cache event stream
#[derive(Debug)]
pub struct EventStream {
  rx: mpsc::UnboundedReceiver<CacheEvent>,
}

impl EventStream {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<CacheEvent> {
    self.rx.recv().await
  }

  /// Receive an event if one is already queued
  pub fn try_next(&mut self) -> Option<CacheEvent> {
    self.rx.try_recv().ok()
  }
}

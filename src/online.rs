//! Connectivity signal consulted by the network-mode policy.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared online/offline flag.
///
/// The surrounding application owns detection and reports changes through
/// [`OnlineManager::set_online`]. Paused fetches wait on this signal.
#[derive(Debug, Clone)]
pub struct OnlineManager {
  tx: Arc<watch::Sender<bool>>,
}

impl OnlineManager {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Returns true if it changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      tracing::info!(online, "Connectivity changed");
    }
    changed
  }

  /// Resolve once the flag reports online.
  pub async fn wait_online(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives as long as `self`, so this cannot observe a closed channel.
    let _ = rx.wait_for(|online| *online).await;
  }
}

impl Default for OnlineManager {
  fn default() -> Self {
    Self::new(true)
  }
}

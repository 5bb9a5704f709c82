//! Attempt loop shared by queries and mutations.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::online::OnlineManager;
use crate::query::QueryFn;

/// Callbacks for state changes the owner of the attempt loop must reflect.
pub(crate) trait RetryHooks: Send + Sync {
  /// The loop is waiting for connectivity.
  fn on_pause(&self);
  /// Connectivity returned and the loop resumed.
  fn on_continue(&self);
  /// An attempt failed; `failure_count` includes this failure.
  fn on_failure(&self, failure_count: u32, error: &Error);
}

/// Runs a query function under a retry policy.
pub(crate) struct Retryer {
  policy: RetryPolicy,
  online: OnlineManager,
  cancel_retry: Arc<AtomicBool>,
}

impl Retryer {
  pub fn new(policy: RetryPolicy, online: OnlineManager) -> Self {
    Self {
      policy,
      online,
      cancel_retry: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Flag that stops further retries once set. The current attempt is not interrupted.
  pub fn cancel_retry_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.cancel_retry)
  }

  fn is_retry_cancelled(&self) -> bool {
    self.cancel_retry.load(Ordering::SeqCst)
  }

  /// Whether the first attempt would have to wait for connectivity.
  pub fn starts_paused(&self) -> bool {
    !self.policy.network_mode.can_fetch(self.online.is_online())
  }

  pub async fn run<H: RetryHooks + ?Sized>(&self, query_fn: &QueryFn, hooks: &H) -> Result<Value> {
    if self.starts_paused() {
      self.pause(hooks).await;
    }

    let mut failures = 0u32;
    loop {
      let result = match tokio::time::timeout(self.policy.timeout, query_fn()).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(self.policy.timeout)),
      };

      let error = match result {
        Ok(value) => return Ok(value),
        Err(error) => error,
      };

      failures += 1;
      hooks.on_failure(failures, &error);

      if failures > self.policy.retry
        || self.is_retry_cancelled()
        || matches!(error, Error::Cancelled)
      {
        return Err(error);
      }

      let delay = self.policy.delay(failures - 1);
      tracing::debug!(failures, ?delay, %error, "Attempt failed, retrying");
      tokio::time::sleep(delay).await;

      if !self.policy.network_mode.can_retry(self.online.is_online()) {
        self.pause(hooks).await;
      }
      if self.is_retry_cancelled() {
        return Err(error);
      }
    }
  }

  async fn pause<H: RetryHooks + ?Sized>(&self, hooks: &H) {
    hooks.on_pause();
    self.online.wait_online().await;
    hooks.on_continue();
  }
}

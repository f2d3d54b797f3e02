//! Cancellable delayed-task primitive used to coalesce snapshot writes.

use std::sync::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::lock;

/// Runs at most one pending task, restarting the delay on every `schedule`.
///
/// Outside a tokio runtime the task runs inline, immediately.
#[derive(Debug, Default)]
pub struct Debouncer {
  pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace any pending task with `task`, to run after `delay`.
  pub fn schedule<F>(&self, delay: Duration, task: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let mut pending = lock(&self.pending);

    if let Some(previous) = pending.take() {
      previous.abort();
    }

    match Handle::try_current() {
      Ok(handle) => {
        *pending = Some(handle.spawn(async move {
          tokio::time::sleep(delay).await;
          task();
        }));
      }
      Err(_) => task(),
    }
  }

  /// Drop the pending task without running it.
  pub fn cancel(&self) {
    let mut pending = lock(&self.pending);

    if let Some(previous) = pending.take() {
      previous.abort();
    }
  }

  /// Whether a scheduled task has not finished yet.
  pub fn is_pending(&self) -> bool {
    lock(&self.pending)
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }
}

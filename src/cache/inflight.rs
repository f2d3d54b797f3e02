//! Collapses concurrent identical fetches into a single shared operation.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::lock;

/// Result of a shared operation. Errors are rendered to strings so every
/// attached caller can get its own copy.
pub type SharedResult<T> = Result<T, String>;

/// A handle to an operation that any number of callers may await.
pub type SharedOperation<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

/// Handle returned by [`InFlightRegistry::get_or_create`].
pub enum InFlight<T> {
  /// This caller started the operation
  Started(SharedOperation<T>),
  /// The operation was already running; this caller joined it
  Attached(SharedOperation<T>),
}

impl<T: Clone> InFlight<T> {
  pub fn is_attached(&self) -> bool {
    matches!(self, InFlight::Attached(_))
  }

  /// Wait for the operation to settle.
  pub async fn wait(self) -> SharedResult<T> {
    match self {
      InFlight::Started(operation) | InFlight::Attached(operation) => operation.await,
    }
  }
}

/// Outcome of [`InFlightRegistry::get_or_create_unless`].
pub enum Admission<T, H> {
  /// The settled check produced a value; nothing was joined or started
  Ready(H),
  Flight(InFlight<T>),
}

struct Registration<T> {
  id: u64,
  operation: SharedOperation<T>,
}

struct RegistryState<T> {
  next_id: u64,
  operations: HashMap<String, Registration<T>>,
}

/// At most one outstanding operation per key.
///
/// Operations are spawned onto the runtime so they run to completion even if
/// every caller stops waiting. A settled operation unregisters itself before
/// its result is visible to any caller.
pub struct InFlightRegistry<T> {
  state: Arc<Mutex<RegistryState<T>>>,
}

impl<T> InFlightRegistry<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(RegistryState {
        next_id: 0,
        operations: HashMap::new(),
      })),
    }
  }

  /// Join the operation registered under `key`, or start one with `factory`.
  ///
  /// `factory` runs while the registry is locked and must not call back into it.
  /// Must be called from within a tokio runtime.
  pub fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> InFlight<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SharedResult<T>> + Send + 'static,
  {
    let mut state = lock(&self.state);
    self.join_or_start(&mut state, key, factory)
  }

  /// Like [`get_or_create`](Self::get_or_create), but first runs `settled`
  /// under the registry lock and returns its value if it has one.
  ///
  /// An operation that settles after the caller's own lookup has already
  /// unregistered by the time `settled` runs, so anything it published before
  /// unregistering is visible to `settled`.
  pub fn get_or_create_unless<H, S, F, Fut>(
    &self,
    key: &str,
    settled: S,
    factory: F,
  ) -> Admission<T, H>
  where
    S: FnOnce() -> Option<H>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = SharedResult<T>> + Send + 'static,
  {
    let mut state = lock(&self.state);

    if !state.operations.contains_key(key) {
      if let Some(value) = settled() {
        return Admission::Ready(value);
      }
    }

    Admission::Flight(self.join_or_start(&mut state, key, factory))
  }

  fn join_or_start<F, Fut>(
    &self,
    state: &mut RegistryState<T>,
    key: &str,
    factory: F,
  ) -> InFlight<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SharedResult<T>> + Send + 'static,
  {
    if let Some(existing) = state.operations.get(key) {
      debug!(key, "Attaching to in-flight request");
      return InFlight::Attached(existing.operation.clone());
    }

    let id = state.next_id;
    state.next_id += 1;

    let future = factory();
    let registry = Arc::clone(&self.state);
    let owned_key = key.to_string();

    let task = tokio::spawn(async move {
      let result = future.await;

      let mut state = lock(&registry);
      if state
        .operations
        .get(&owned_key)
        .is_some_and(|registration| registration.id == id)
      {
        state.operations.remove(&owned_key);
      }

      result
    });

    let operation = task
      .map(|joined| joined.unwrap_or_else(|e| Err(format!("In-flight request aborted: {}", e))))
      .boxed()
      .shared();

    state.operations.insert(
      key.to_string(),
      Registration {
        id,
        operation: operation.clone(),
      },
    );

    InFlight::Started(operation)
  }

  /// Whether an operation is outstanding for `key`.
  pub fn contains(&self, key: &str) -> bool {
    lock(&self.state).operations.contains_key(key)
  }

  pub fn len(&self) -> usize {
    lock(&self.state).operations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<T> Default for InFlightRegistry<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for InFlightRegistry<T> {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
    }
  }
}

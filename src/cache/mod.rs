//! Generic client-side caching layer.
//!
//! This module provides a resource-agnostic caching mechanism that:
//! - Keeps a bounded, FIFO-evicted, TTL-expiring store of values by string key
//! - Collapses concurrent fetches for the same key into one remote call
//! - Persists the store to a durable slot with debounced, best-effort writes
//! - Recovers from storage quota exhaustion by pruning the oldest half

mod debounce;
mod inflight;
mod layer;
mod persistence;
mod store;
mod traits;

pub use debounce::Debouncer;
pub use inflight::{Admission, InFlight, InFlightRegistry, SharedOperation, SharedResult};
pub use layer::{system_clock, CacheConfig, CacheLayer, Clock, DEFAULT_SAVE_DEBOUNCE};
pub use persistence::{
  MemorySlotStorage, PersistenceAdapter, SaveOutcome, SlotError, SlotStorage, SqliteSlotStorage,
  DEFAULT_SLOT,
};
pub use store::{CacheStore, Lookup, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
pub use traits::{CacheEntry, CacheResult, CacheSource, Cacheable, Snapshot};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

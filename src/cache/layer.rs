//! Cache layer that orchestrates the store, persistence and request dedup.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::debounce::Debouncer;
use super::inflight::{Admission, InFlightRegistry};
use super::lock;
use super::persistence::{PersistenceAdapter, SaveOutcome};
use super::store::{CacheStore, Lookup, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use super::traits::{CacheEntry, CacheResult, Cacheable};

/// Default window over which snapshot writes are coalesced.
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
  Arc::new(Utc::now)
}

/// Configuration for the cache layer.
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// Maximum number of cached entries
  pub max_entries: usize,
  /// How long a cached entry stays valid
  pub ttl: Duration,
  /// Quiet period after the last mutation before the snapshot is written
  pub save_debounce: Duration,
  /// Drop results of fetches that were already running when an invalidation happened
  pub stale_fill_guard: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_entries: DEFAULT_MAX_ENTRIES,
      ttl: DEFAULT_TTL,
      save_debounce: DEFAULT_SAVE_DEBOUNCE,
      stale_fill_guard: false,
    }
  }
}

impl CacheConfig {
  pub fn with_max_entries(mut self, max: usize) -> Self {
    self.max_entries = max;
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_save_debounce(mut self, delay: Duration) -> Self {
    self.save_debounce = delay;
    self
  }

  pub fn with_stale_fill_guard(mut self, enabled: bool) -> Self {
    self.stale_fill_guard = enabled;
    self
  }
}

/// Cache layer that manages caching logic and network fetching.
///
/// Cloning is cheap; clones share the same store, registry and persistence.
pub struct CacheLayer<T> {
  store: Arc<Mutex<CacheStore<T>>>,
  persistence: Arc<PersistenceAdapter>,
  debouncer: Arc<Debouncer>,
  inflight: InFlightRegistry<T>,
  config: CacheConfig,
  clock: Clock,
}

impl<T: Cacheable> CacheLayer<T> {
  /// Create a cache layer, restoring whatever the persistence adapter holds.
  pub fn new(config: CacheConfig, persistence: PersistenceAdapter) -> Self {
    Self::with_clock(config, persistence, system_clock())
  }

  pub fn with_clock(config: CacheConfig, persistence: PersistenceAdapter, clock: Clock) -> Self {
    let layer = Self {
      store: Arc::new(Mutex::new(CacheStore::new(config.max_entries, config.ttl))),
      persistence: Arc::new(persistence),
      debouncer: Arc::new(Debouncer::new()),
      inflight: InFlightRegistry::new(),
      config,
      clock,
    };
    layer.restore();
    layer
  }

  fn restore(&self) {
    if !self.persistence.is_available() {
      return;
    }

    let snapshot = self.persistence.load::<T>();
    let loaded = snapshot.len();
    let dropped = lock(&self.store).restore(snapshot, self.now());
    debug!(loaded, dropped, "Restored cache snapshot");

    // Rewrite right away so expired entries are not read back on the next start
    if dropped > 0 {
      self.schedule_save(Duration::ZERO);
    }
  }

  fn now(&self) -> DateTime<Utc> {
    (self.clock)()
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// The unexpired entry under `key`. An expired entry is purged.
  pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
    let lookup = lock(&self.store).lookup(key, self.now());
    match lookup {
      Lookup::Hit(entry) => Some(entry),
      Lookup::Expired => {
        debug!(key, "Cache entry expired");
        self.schedule_save(self.config.save_debounce);
        None
      }
      Lookup::Missing => None,
    }
  }

  pub fn set(&self, key: &str, value: T) {
    let evicted = lock(&self.store).set(key, value, self.now());
    if let Some(evicted) = evicted {
      debug!(key, evicted = %evicted, "Cache full, evicted oldest entry");
    }
    self.schedule_save(self.config.save_debounce);
  }

  /// Remove every entry whose key starts with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let removed = lock(&self.store).invalidate_prefix(prefix);
    if removed > 0 {
      debug!(prefix, removed, "Invalidated cache prefix");
      self.schedule_save(self.config.save_debounce);
    }
    removed
  }

  /// Remove the entry under `key`.
  pub fn invalidate_key(&self, key: &str) -> bool {
    let removed = lock(&self.store).invalidate_key(key);
    if removed {
      debug!(key, "Invalidated cache key");
      self.schedule_save(self.config.save_debounce);
    }
    removed
  }

  /// Remove every entry and erase the durable snapshot.
  pub fn clear(&self) {
    lock(&self.store).clear();
    self.debouncer.cancel();
    self.persistence.clear();
    debug!("Cache cleared");
  }

  pub fn len(&self) -> usize {
    lock(&self.store).len()
  }

  pub fn is_empty(&self) -> bool {
    lock(&self.store).is_empty()
  }

  /// Cached keys from oldest to newest insertion.
  pub fn keys(&self) -> Vec<String> {
    lock(&self.store).keys().map(String::from).collect()
  }

  /// Whether a fetch is outstanding for `key`.
  pub fn is_fetching(&self, key: &str) -> bool {
    self.inflight.contains(key)
  }

  /// Run any pending debounced save now.
  pub fn flush(&self) -> SaveOutcome {
    self.debouncer.cancel();
    save_snapshot(&self.store, &self.persistence)
  }

  fn schedule_save(&self, delay: Duration) {
    if !self.persistence.is_available() {
      return;
    }

    let store = Arc::clone(&self.store);
    let persistence = Arc::clone(&self.persistence);
    self.debouncer.schedule(delay, move || {
      save_snapshot(&store, &persistence);
    });
  }

  /// Fetch with cache-first strategy and request dedup.
  ///
  /// 1. Unexpired cache entry: return it, no fetch
  /// 2. Fetch already running for `key`: wait for its result
  /// 3. Otherwise run `fetcher`, cache its value on success
  ///
  /// Failures are never cached.
  pub async fn fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<CacheResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if let Some(entry) = self.get(key) {
      debug!(key, "Cache hit");
      return Ok(CacheResult::from_cache(entry.data, entry.expiry));
    }

    debug!(key, "Cache miss");
    let generation = lock(&self.store).generation();
    let layer = self.clone();
    let owned_key = key.to_string();

    // Re-checked under the registry lock: a fetch that settled since the
    // lookup above has already stored its value before unregistering.
    let admission = self.inflight.get_or_create_unless(
      key,
      || self.get(key),
      move || {
        let request = fetcher();
        async move {
          match request.await {
            Ok(data) => {
              layer.fill(&owned_key, data.clone(), generation);
              Ok(data)
            }
            Err(e) => Err(format!("{:#}", e)),
          }
        }
      },
    );

    let flight = match admission {
      Admission::Ready(entry) => {
        debug!(key, "Cache filled by a request that just settled");
        return Ok(CacheResult::from_cache(entry.data, entry.expiry));
      }
      Admission::Flight(flight) => flight,
    };

    let attached = flight.is_attached();
    let data = flight.wait().await.map_err(|e| eyre!("{}", e))?;

    Ok(if attached {
      CacheResult::from_shared(data)
    } else {
      CacheResult::from_network(data)
    })
  }

  fn fill(&self, key: &str, value: T, generation: u64) {
    if self.config.stale_fill_guard {
      let stored = lock(&self.store).set_if_generation(key, value, self.now(), generation);
      if !stored {
        debug!(key, "Cache invalidated during fetch, not storing result");
        return;
      }
      self.schedule_save(self.config.save_debounce);
    } else {
      self.set(key, value);
    }
  }
}

/// Write the current store contents, pruning to half on quota exhaustion.
fn save_snapshot<T: Cacheable>(
  store: &Mutex<CacheStore<T>>,
  persistence: &PersistenceAdapter,
) -> SaveOutcome {
  let snapshot = lock(store).snapshot();
  persistence.save(&snapshot, || {
    let mut store = lock(store);
    let dropped = store.prune_to_half();
    debug!(dropped, remaining = store.len(), "Pruned cache after quota failure");
    store.snapshot()
  })
}

impl<T> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      persistence: Arc::clone(&self.persistence),
      debouncer: Arc::clone(&self.debouncer),
      inflight: self.inflight.clone(),
      config: self.config.clone(),
      clock: Arc::clone(&self.clock),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::persistence::{MemorySlotStorage, SlotStorage, DEFAULT_SLOT};
  use crate::cache::traits::CacheSource;
  use chrono::TimeDelta;
  use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

  fn layer_with(storage: &Arc<MemorySlotStorage>, config: CacheConfig) -> CacheLayer<Vec<u32>> {
    CacheLayer::new(config, PersistenceAdapter::new(storage.clone(), DEFAULT_SLOT))
  }

  fn counting_fetch(
    calls: &Arc<AtomicU32>,
    value: Vec<u32>,
  ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<Vec<u32>>> + Send>> {
    let calls = calls.clone();
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(value)
      })
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_miss_then_hit() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default());
    let calls = Arc::new(AtomicU32::new(0));

    let first = layer.fetch("todos_1_20", counting_fetch(&calls, vec![1, 2])).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = layer.fetch("todos_1_20", counting_fetch(&calls, vec![9])).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data, vec![1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_fetches_dedup() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default());
    let calls = Arc::new(AtomicU32::new(0));

    let (a, b) = tokio::join!(
      layer.fetch("todos_1_20", counting_fetch(&calls, vec![1])),
      layer.fetch("todos_1_20", counting_fetch(&calls, vec![2])),
    );

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data, vec![1]);
    assert_eq!(b.data, vec![1]);
    assert_eq!(a.source, CacheSource::Network);
    assert_eq!(b.source, CacheSource::Shared);
    assert!(!layer.is_fetching("todos_1_20"));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_callers_racing_settlement_never_refetch() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default());
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..64 {
      let layer = layer.clone();
      let calls = calls.clone();
      handles.push(tokio::spawn(async move {
        layer
          .fetch("todos_1_20", move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
              tokio::task::yield_now().await;
              Ok(vec![1])
            }
          })
          .await
      }));
    }

    for handle in handles {
      assert_eq!(handle.await.unwrap().unwrap().data, vec![1]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_fetch_is_not_cached() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default());

    let result = layer
      .fetch("todos_1_20", || async { Err(eyre!("HTTP 500")) })
      .await;
    assert!(result.unwrap_err().to_string().contains("HTTP 500"));
    assert!(layer.is_empty());
    assert!(!layer.is_fetching("todos_1_20"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_ttl_expiry_refetches() {
    let storage = Arc::new(MemorySlotStorage::new());
    let offset_ms = Arc::new(AtomicI64::new(0));
    let base = Utc::now();
    let clock: Clock = {
      let offset_ms = offset_ms.clone();
      Arc::new(move || base + TimeDelta::milliseconds(offset_ms.load(Ordering::SeqCst)))
    };
    let layer = CacheLayer::with_clock(
      CacheConfig::default(),
      PersistenceAdapter::new(storage.clone(), DEFAULT_SLOT),
      clock,
    );
    let calls = Arc::new(AtomicU32::new(0));

    layer.fetch("todo_1", counting_fetch(&calls, vec![1])).await.unwrap();
    offset_ms.store(5 * 60 * 1000 + 1, Ordering::SeqCst);

    assert!(layer.get("todo_1").is_none());
    assert!(layer.is_empty());
    layer.fetch("todo_1", counting_fetch(&calls, vec![1])).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutations_coalesce_into_one_save() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default());

    layer.set("todo_1", vec![1]);
    tokio::time::sleep(Duration::from_millis(500)).await;
    layer.set("todo_2", vec![2]);
    tokio::time::sleep(Duration::from_millis(500)).await;
    layer.set("todo_3", vec![3]);
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(storage.write_count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(storage.write_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unmatched_invalidation_does_not_save() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default());
    layer.set("todo_1", vec![1]);
    layer.flush();
    assert_eq!(storage.write_count(), 1);

    assert_eq!(layer.invalidate_prefix("todos"), 0);
    assert!(!layer.invalidate_key("todo_2"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(storage.write_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_snapshot_survives_restart() {
    let storage = Arc::new(MemorySlotStorage::new());
    {
      let layer = layer_with(&storage, CacheConfig::default());
      layer.set("todos_1_20", vec![1, 2, 3]);
      layer.set("todo_1", vec![1]);
      tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let layer = layer_with(&storage, CacheConfig::default());
    assert_eq!(layer.keys(), vec!["todos_1_20", "todo_1"]);
    assert_eq!(layer.get("todos_1_20").map(|e| e.data), Some(vec![1, 2, 3]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_load_drops_expired_and_rewrites_immediately() {
    let storage = Arc::new(MemorySlotStorage::new());
    {
      let layer = layer_with(&storage, CacheConfig::default());
      layer.set("todo_1", vec![1]);
      layer.set("todo_2", vec![2]);
      layer.flush();
    }
    let writes = storage.write_count();

    // Restart ten minutes later
    let later = Utc::now() + TimeDelta::minutes(10);
    let fresh = CacheLayer::<Vec<u32>>::with_clock(
      CacheConfig::default(),
      PersistenceAdapter::new(storage.clone(), DEFAULT_SLOT),
      Arc::new(move || later),
    );
    assert!(fresh.is_empty());

    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(!storage.contains(DEFAULT_SLOT));
    assert_eq!(storage.write_count(), writes);
  }

  #[tokio::test(start_paused = true)]
  async fn test_emptied_cache_removes_snapshot() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default());
    layer.set("todo_1", vec![1]);
    layer.flush();
    assert!(storage.contains(DEFAULT_SLOT));

    layer.invalidate_key("todo_1");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!storage.contains(DEFAULT_SLOT));
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_erases_snapshot_and_pending_save() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default());
    layer.set("todo_1", vec![1]);
    layer.flush();
    layer.set("todo_2", vec![2]);

    layer.clear();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(layer.is_empty());
    assert!(!storage.contains(DEFAULT_SLOT));
    assert_eq!(storage.write_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_quota_failure_prunes_to_half() {
    // Size the quota from a two-entry snapshot
    let sizing = Arc::new(MemorySlotStorage::new());
    let sizing_layer = layer_with(&sizing, CacheConfig::default());
    sizing_layer.set("todo_2", vec![2]);
    sizing_layer.set("todo_3", vec![3]);
    sizing_layer.flush();
    let quota = sizing.read(DEFAULT_SLOT).unwrap().unwrap().len() + 32;

    let storage = Arc::new(MemorySlotStorage::with_quota(quota));
    let layer = layer_with(&storage, CacheConfig::default());
    for i in 0..4 {
      layer.set(&format!("todo_{}", i), vec![i]);
    }

    assert_eq!(layer.flush(), SaveOutcome::SavedAfterPrune);
    assert_eq!(layer.keys(), vec!["todo_2", "todo_3"]);
    assert!(storage.contains(DEFAULT_SLOT));
  }

  #[tokio::test(start_paused = true)]
  async fn test_unavailable_storage_still_caches() {
    let layer: CacheLayer<Vec<u32>> =
      CacheLayer::new(CacheConfig::default(), PersistenceAdapter::unavailable());
    layer.set("todo_1", vec![1]);
    assert_eq!(layer.get("todo_1").map(|e| e.data), Some(vec![1]));
    assert_eq!(layer.flush(), SaveOutcome::Skipped);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fill_after_invalidation_is_kept_by_default() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default());
    let calls = Arc::new(AtomicU32::new(0));

    let pending = layer.fetch("todos_1_20", counting_fetch(&calls, vec![1]));
    let invalidate = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      layer.invalidate_prefix("todos");
    };
    let (result, _) = tokio::join!(pending, invalidate);

    assert_eq!(result.unwrap().data, vec![1]);
    assert_eq!(layer.keys(), vec!["todos_1_20"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_fill_guard_drops_late_result() {
    let storage = Arc::new(MemorySlotStorage::new());
    let layer = layer_with(&storage, CacheConfig::default().with_stale_fill_guard(true));
    let calls = Arc::new(AtomicU32::new(0));

    let pending = layer.fetch("todos_1_20", counting_fetch(&calls, vec![1]));
    let invalidate = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      layer.invalidate_prefix("todos");
    };
    let (result, _) = tokio::join!(pending, invalidate);

    // The caller still gets the value, the cache does not keep it
    assert_eq!(result.unwrap().data, vec![1]);
    assert!(layer.is_empty());
  }
}

//! Bounded, insertion-ordered key/entry store with expiry.

use chrono::{DateTime, TimeDelta, Utc};
use indexmap::IndexMap;
use std::time::Duration;

use super::traits::{CacheEntry, Snapshot};

/// Default maximum number of entries.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Default time-to-live for every entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
  Hit(CacheEntry<T>),
  /// The entry had expired and was removed by this lookup
  Expired,
  Missing,
}

/// In-memory cache store.
///
/// Eviction is FIFO by insertion order. Reads never reorder entries, so the
/// front of the map is always the oldest insertion still present.
#[derive(Debug)]
pub struct CacheStore<T> {
  entries: IndexMap<String, CacheEntry<T>>,
  max_entries: usize,
  ttl: TimeDelta,
  /// Bumped on every invalidation and clear
  generation: u64,
}

impl<T: Clone> CacheStore<T> {
  /// A store holding at most `max_entries` (at least one) entries, each valid for `ttl`.
  pub fn new(max_entries: usize, ttl: Duration) -> Self {
    Self {
      entries: IndexMap::new(),
      max_entries: max_entries.max(1),
      ttl: TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::days(365 * 100)),
      generation: 0,
    }
  }

  pub fn max_entries(&self) -> usize {
    self.max_entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Keys from oldest to newest insertion.
  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.entries.keys().map(String::as_str)
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Look up a key, purging it if it has expired.
  pub fn lookup(&mut self, key: &str, now: DateTime<Utc>) -> Lookup<T> {
    match self.entries.get(key) {
      None => Lookup::Missing,
      Some(entry) if entry.is_valid_at(now) => Lookup::Hit(entry.clone()),
      Some(_) => {
        self.entries.shift_remove(key);
        Lookup::Expired
      }
    }
  }

  /// The value under `key` if present and unexpired.
  pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<T> {
    match self.lookup(key, now) {
      Lookup::Hit(entry) => Some(entry.data),
      Lookup::Expired | Lookup::Missing => None,
    }
  }

  /// Insert `value` under `key`, expiring `ttl` from `now`.
  ///
  /// An existing entry is replaced in its original position. When the store
  /// is full before the insert, the first entry in iteration order is evicted
  /// and its key returned, even if `key` itself is already present.
  pub fn set(&mut self, key: &str, value: T, now: DateTime<Utc>) -> Option<String> {
    let expiry = now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);

    let evicted = if self.entries.len() >= self.max_entries {
      self.entries.shift_remove_index(0).map(|(k, _)| k)
    } else {
      None
    };

    self
      .entries
      .insert(key.to_string(), CacheEntry::new(value, expiry));
    evicted
  }

  /// Like [`set`](Self::set), but only if no invalidation happened since `generation`.
  pub fn set_if_generation(
    &mut self,
    key: &str,
    value: T,
    now: DateTime<Utc>,
    generation: u64,
  ) -> bool {
    if self.generation != generation {
      return false;
    }
    self.set(key, value, now);
    true
  }

  /// Remove every entry whose key starts with `prefix`. Returns how many were removed.
  pub fn invalidate_prefix(&mut self, prefix: &str) -> usize {
    self.generation += 1;
    let before = self.entries.len();
    self.entries.retain(|key, _| !key.starts_with(prefix));
    before - self.entries.len()
  }

  /// Remove exactly one entry. Returns whether anything was removed.
  pub fn invalidate_key(&mut self, key: &str) -> bool {
    self.generation += 1;
    self.entries.shift_remove(key).is_some()
  }

  pub fn clear(&mut self) {
    self.generation += 1;
    self.entries.clear();
  }

  /// Drop the oldest entries until half of the current count remains.
  /// Returns how many were dropped.
  pub fn prune_to_half(&mut self) -> usize {
    let drop_count = self.entries.len() - self.entries.len() / 2;
    self.entries.drain(..drop_count);
    drop_count
  }

  /// Ordered copy of every entry, expired or not.
  pub fn snapshot(&self) -> Snapshot<T> {
    self
      .entries
      .iter()
      .map(|(key, entry)| (key.clone(), entry.clone()))
      .collect()
  }

  /// Replace the contents with the unexpired entries of `snapshot`, keeping
  /// their order. Returns how many entries were dropped as expired.
  pub fn restore(&mut self, snapshot: Snapshot<T>, now: DateTime<Utc>) -> usize {
    self.entries.clear();
    let mut dropped = 0;

    for (key, entry) in snapshot {
      if !entry.is_valid_at(now) {
        dropped += 1;
        continue;
      }
      if self.entries.len() >= self.max_entries {
        self.entries.shift_remove_index(0);
      }
      self.entries.insert(key, entry);
    }

    dropped
  }
}

impl<T: Clone> Default for CacheStore<T> {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
  }
}

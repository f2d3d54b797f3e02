//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Trait for values that can live in the cache.
///
/// Values are cloned out on every hit and shared between every caller attached
/// to one in-flight fetch, and they round-trip through the durable snapshot.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A cached value together with the instant it stops being valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub data: T,
  pub expiry: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, expiry: DateTime<Utc>) -> Self {
    Self { data, expiry }
  }

  /// An entry is valid up to and including its expiry instant.
  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    now <= self.expiry
  }
}

/// Ordered `(key, entry)` pairs, oldest insertion first.
pub type Snapshot<T> = Vec<(String, CacheEntry<T>)>;

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the cached copy expires (if from cache)
  pub expires_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from a fetch this caller started.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      expires_at: None,
    }
  }

  /// Create a new cache result from a fetch another caller started.
  pub fn from_shared(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Shared,
      expires_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, expires_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      expires_at: Some(expires_at),
    }
  }
}

/// Indicates where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from a remote call started by this caller
  Network,
  /// Data from a remote call that was already in flight for the same key
  Shared,
  /// Unexpired data from the cache, no remote call made
  Cache,
}

//! Durable snapshot persistence: slot backends and the adapter that drives them.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::lock;
use super::traits::Snapshot;

/// Default name of the slot holding the cache snapshot.
pub const DEFAULT_SLOT: &str = "task_cache";

/// Failure writing to or reading from a durable slot.
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
  #[error("storage quota exceeded writing {size} bytes")]
  QuotaExceeded { size: usize },
  #[error("storage backend error: {0}")]
  Backend(String),
}

/// A named-slot byte store.
pub trait SlotStorage: Send + Sync {
  /// Read a slot. `None` if it was never written or has been removed.
  fn read(&self, slot: &str) -> Result<Option<Vec<u8>>, SlotError>;

  /// Replace the contents of a slot.
  fn write(&self, slot: &str, data: &[u8]) -> Result<(), SlotError>;

  /// Delete a slot. Deleting a missing slot is not an error.
  fn remove(&self, slot: &str) -> Result<(), SlotError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Slot storage kept in process memory, with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemorySlotStorage {
  slots: Mutex<HashMap<String, Vec<u8>>>,
  quota_bytes: Option<usize>,
  writes: AtomicUsize,
}

impl MemorySlotStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Writes larger than `quota_bytes` fail with [`SlotError::QuotaExceeded`].
  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      quota_bytes: Some(quota_bytes),
      ..Self::default()
    }
  }

  /// Number of successful writes so far.
  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  pub fn contains(&self, slot: &str) -> bool {
    lock(&self.slots).contains_key(slot)
  }
}

impl SlotStorage for MemorySlotStorage {
  fn read(&self, slot: &str) -> Result<Option<Vec<u8>>, SlotError> {
    Ok(lock(&self.slots).get(slot).cloned())
  }

  fn write(&self, slot: &str, data: &[u8]) -> Result<(), SlotError> {
    if self.quota_bytes.is_some_and(|quota| data.len() > quota) {
      return Err(SlotError::QuotaExceeded { size: data.len() });
    }
    lock(&self.slots).insert(slot.to_string(), data.to_vec());
    self.writes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn remove(&self, slot: &str) -> Result<(), SlotError> {
    lock(&self.slots).remove(slot);
    Ok(())
  }
}

// ============================================================================
// SQLite backend
// ============================================================================

/// SQLite-based slot storage.
pub struct SqliteSlotStorage {
  conn: Mutex<Connection>,
  quota_bytes: Option<usize>,
}

/// Schema for the slot table.
const SLOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_slots (
    name TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteSlotStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path, quota_bytes: Option<usize>) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn, quota_bytes)
  }

  /// Storage backed by a private in-memory SQLite database.
  pub fn open_in_memory(quota_bytes: Option<usize>) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn, quota_bytes)
  }

  fn from_connection(conn: Connection, quota_bytes: Option<usize>) -> Result<Self> {
    conn
      .execute_batch(SLOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
      quota_bytes,
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("taskcache").join("cache.db"))
  }
}

fn sqlite_error(e: rusqlite::Error, size: usize) -> SlotError {
  match e {
    rusqlite::Error::SqliteFailure(ref failure, _)
      if failure.code == rusqlite::ErrorCode::DiskFull =>
    {
      SlotError::QuotaExceeded { size }
    }
    other => SlotError::Backend(other.to_string()),
  }
}

impl SlotStorage for SqliteSlotStorage {
  fn read(&self, slot: &str) -> Result<Option<Vec<u8>>, SlotError> {
    let conn = lock(&self.conn);
    conn
      .query_row(
        "SELECT data FROM kv_slots WHERE name = ?",
        params![slot],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| sqlite_error(e, 0))
  }

  fn write(&self, slot: &str, data: &[u8]) -> Result<(), SlotError> {
    if self.quota_bytes.is_some_and(|quota| data.len() > quota) {
      return Err(SlotError::QuotaExceeded { size: data.len() });
    }

    let conn = lock(&self.conn);
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_slots (name, data, written_at) VALUES (?, ?, datetime('now'))",
        params![slot, data],
      )
      .map_err(|e| sqlite_error(e, data.len()))?;
    Ok(())
  }

  fn remove(&self, slot: &str) -> Result<(), SlotError> {
    let conn = lock(&self.conn);
    conn
      .execute("DELETE FROM kv_slots WHERE name = ?", params![slot])
      .map_err(|e| sqlite_error(e, 0))?;
    Ok(())
  }
}

// ============================================================================
// Snapshot encoding
// ============================================================================

/// Encode as `<hex sha256 of payload>\n<json payload>`.
fn encode_snapshot<T: Serialize>(snapshot: &Snapshot<T>) -> Result<Vec<u8>> {
  let payload =
    serde_json::to_vec(snapshot).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;
  let checksum = hex::encode(Sha256::digest(&payload));

  let mut out = Vec::with_capacity(checksum.len() + 1 + payload.len());
  out.extend_from_slice(checksum.as_bytes());
  out.push(b'\n');
  out.extend_from_slice(&payload);
  Ok(out)
}

fn decode_snapshot<T: DeserializeOwned>(bytes: &[u8]) -> Result<Snapshot<T>> {
  let split = bytes
    .iter()
    .position(|b| *b == b'\n')
    .ok_or_else(|| eyre!("Snapshot has no checksum line"))?;
  let (checksum, payload) = (&bytes[..split], &bytes[split + 1..]);

  let actual = hex::encode(Sha256::digest(payload));
  if checksum != actual.as_bytes() {
    return Err(eyre!("Snapshot checksum mismatch"));
  }

  serde_json::from_slice(payload).map_err(|e| eyre!("Failed to parse snapshot: {}", e))
}

// ============================================================================
// Adapter
// ============================================================================

/// What a save attempt ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
  /// Storage is unavailable; nothing was attempted
  Skipped,
  Saved,
  /// The first write hit the quota; the cache was pruned and the retry succeeded
  SavedAfterPrune,
  /// The snapshot was empty so the slot was removed
  Cleared,
  /// The write failed and was dropped
  Failed,
}

/// Reads and writes the cache snapshot in one durable slot.
///
/// Every failure is logged and swallowed: persistence is best-effort.
pub struct PersistenceAdapter {
  storage: Option<Arc<dyn SlotStorage>>,
  slot: String,
}

impl PersistenceAdapter {
  pub fn new(storage: Arc<dyn SlotStorage>, slot: impl Into<String>) -> Self {
    Self {
      storage: Some(storage),
      slot: slot.into(),
    }
  }

  /// An adapter with no durable backend. Every operation is a no-op.
  pub fn unavailable() -> Self {
    info!("Durable storage unavailable, cache will not persist");
    Self {
      storage: None,
      slot: DEFAULT_SLOT.to_string(),
    }
  }

  pub fn is_available(&self) -> bool {
    self.storage.is_some()
  }

  pub fn slot(&self) -> &str {
    &self.slot
  }

  /// Read the snapshot. Absent or corrupt data yields an empty snapshot, and
  /// a corrupt slot is deleted.
  pub fn load<T: DeserializeOwned>(&self) -> Snapshot<T> {
    let Some(storage) = &self.storage else {
      return Vec::new();
    };

    let bytes = match storage.read(&self.slot) {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!(slot = %self.slot, error = %e, "Failed to read cache snapshot");
        return Vec::new();
      }
    };

    match decode_snapshot(&bytes) {
      Ok(snapshot) => snapshot,
      Err(e) => {
        warn!(slot = %self.slot, error = %e, "Discarding corrupt cache snapshot");
        self.clear();
        Vec::new()
      }
    }
  }

  /// Write the snapshot, or remove the slot if the snapshot is empty.
  ///
  /// On a quota failure `prune` is called once to shrink the cache and return
  /// the smaller snapshot, which is then written once more.
  pub fn save<T, F>(&self, snapshot: &Snapshot<T>, prune: F) -> SaveOutcome
  where
    T: Serialize,
    F: FnOnce() -> Snapshot<T>,
  {
    let Some(storage) = &self.storage else {
      return SaveOutcome::Skipped;
    };

    match self.write(storage.as_ref(), snapshot) {
      Ok(outcome) => outcome,
      Err(SlotError::QuotaExceeded { size }) => {
        warn!(slot = %self.slot, size, "Storage quota exceeded, pruning cache to half");
        let pruned = prune();
        match self.write(storage.as_ref(), &pruned) {
          Ok(SaveOutcome::Cleared) => SaveOutcome::Cleared,
          Ok(_) => SaveOutcome::SavedAfterPrune,
          Err(e) => {
            error!(slot = %self.slot, error = %e, "Cache save failed after pruning, dropping write");
            SaveOutcome::Failed
          }
        }
      }
      Err(e) => {
        error!(slot = %self.slot, error = %e, "Cache save failed, dropping write");
        SaveOutcome::Failed
      }
    }
  }

  fn write<T: Serialize>(
    &self,
    storage: &dyn SlotStorage,
    snapshot: &Snapshot<T>,
  ) -> Result<SaveOutcome, SlotError> {
    if snapshot.is_empty() {
      storage.remove(&self.slot)?;
      debug!(slot = %self.slot, "Cache empty, removed snapshot");
      return Ok(SaveOutcome::Cleared);
    }

    let bytes = encode_snapshot(snapshot).map_err(|e| SlotError::Backend(e.to_string()))?;
    storage.write(&self.slot, &bytes)?;
    debug!(slot = %self.slot, entries = snapshot.len(), bytes = bytes.len(), "Saved cache snapshot");
    Ok(SaveOutcome::Saved)
  }

  /// Remove the snapshot slot.
  pub fn clear(&self) {
    if let Some(storage) = &self.storage {
      if let Err(e) = storage.remove(&self.slot) {
        warn!(slot = %self.slot, error = %e, "Failed to remove cache snapshot");
      }
    }
  }
}

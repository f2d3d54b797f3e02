//! Cached task client that wraps a [`TaskApi`] with transparent caching.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheLayer, CacheResult};
use crate::config::Config;

use super::cache::{TaskPayload, TaskQueryKey, LIST_PREFIX};
use super::client::{TaskApi, TaskHttpClient};
use super::types::{NewTask, Task};

/// Task client with transparent caching support.
///
/// Reads are served from the cache when possible and concurrent identical
/// reads share one remote call. Writes invalidate affected entries before the
/// remote call is issued. Remote failures never reach the caller: they are
/// logged and replaced by an empty or absent result.
pub struct CachedTaskClient<A> {
  api: Arc<A>,
  cache: CacheLayer<TaskPayload>,
}

impl CachedTaskClient<TaskHttpClient> {
  /// Build the HTTP client and cache described by `config`.
  pub fn from_config(config: &Config) -> Result<Self> {
    let api = TaskHttpClient::new(config)?;
    let cache = CacheLayer::new(config.cache.to_cache_config(), config.persistence());
    Ok(Self::new(api, cache))
  }
}

impl<A: TaskApi + 'static> CachedTaskClient<A> {
  pub fn new(api: A, cache: CacheLayer<TaskPayload>) -> Self {
    Self {
      api: Arc::new(api),
      cache,
    }
  }

  pub fn cache(&self) -> &CacheLayer<TaskPayload> {
    &self.cache
  }

  /// One page of tasks, empty if the remote call fails.
  pub async fn list(&self, page: u32, limit: u32) -> Vec<Task> {
    let query_key = TaskQueryKey::List { page, limit };
    let api = Arc::clone(&self.api);

    let result = self
      .cache
      .fetch(&query_key.cache_key(), move || async move {
        api.list(page, limit).await.map(TaskPayload::List)
      })
      .await;

    match result {
      Ok(CacheResult {
        data: TaskPayload::List(tasks),
        source,
        ..
      }) => {
        debug!(query = %query_key.description(), ?source, count = tasks.len(), "Listed tasks");
        tasks
      }
      Ok(_) => {
        warn!(query = %query_key.description(), "Cached value has the wrong shape");
        self.cache.invalidate_key(&query_key.cache_key());
        Vec::new()
      }
      Err(e) => {
        warn!(query = %query_key.description(), error = %e, "Failed to list tasks, returning empty list");
        Vec::new()
      }
    }
  }

  /// A single task, absent if the remote call fails.
  pub async fn get(&self, id: &str) -> Option<Task> {
    let query_key = TaskQueryKey::Item { id: id.to_string() };
    let api = Arc::clone(&self.api);
    let owned_id = id.to_string();

    let result = self
      .cache
      .fetch(&query_key.cache_key(), move || async move {
        api.get(&owned_id).await.map(TaskPayload::Item)
      })
      .await;

    match result {
      Ok(CacheResult {
        data: TaskPayload::Item(task),
        source,
        ..
      }) => {
        debug!(query = %query_key.description(), ?source, "Got task");
        Some(task)
      }
      Ok(_) => {
        warn!(query = %query_key.description(), "Cached value has the wrong shape");
        self.cache.invalidate_key(&query_key.cache_key());
        None
      }
      Err(e) => {
        warn!(query = %query_key.description(), error = %e, "Failed to get task, returning nothing");
        None
      }
    }
  }

  /// Create a task. Every cached list is invalidated before the call is made.
  ///
  /// The returned task carries a client-minted `server-<millis>` id; the id
  /// the server assigned is discarded.
  pub async fn create(&self, task: NewTask) -> Option<Task> {
    self.cache.invalidate_prefix(LIST_PREFIX);

    match self.api.create(&task).await {
      Ok(created) => Some(Task {
        id: format!("server-{}", Utc::now().timestamp_millis()),
        ..created
      }),
      Err(e) => {
        warn!(error = %e, "Failed to create task");
        None
      }
    }
  }

  /// Update a task. Its own entry and every cached list are invalidated first.
  pub async fn update(&self, task: Task) -> Option<Task> {
    self.invalidate_item(&task.id);

    match self.api.update(&task).await {
      Ok(updated) => Some(updated),
      Err(e) => {
        warn!(id = %task.id, error = %e, "Failed to update task");
        None
      }
    }
  }

  /// Delete a task. Its own entry and every cached list are invalidated first.
  pub async fn delete(&self, id: &str) {
    self.invalidate_item(id);

    if let Err(e) = self.api.delete(id).await {
      warn!(id, error = %e, "Failed to delete task");
    }
  }

  /// Drop every cached entry and the persisted snapshot.
  pub fn clear_cache(&self) {
    self.cache.clear();
  }

  fn invalidate_item(&self, id: &str) {
    let key = TaskQueryKey::Item { id: id.to_string() }.cache_key();
    self.cache.invalidate_key(&key);
    self.cache.invalidate_prefix(LIST_PREFIX);
  }
}

impl<A> Clone for CachedTaskClient<A> {
  fn clone(&self) -> Self {
    Self {
      api: Arc::clone(&self.api),
      cache: self.cache.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheConfig, MemorySlotStorage, PersistenceAdapter, DEFAULT_SLOT};
  use async_trait::async_trait;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
  use std::time::Duration;

  /// In-memory stand-in for the remote resource.
  #[derive(Default)]
  struct FakeApi {
    list_calls: AtomicU32,
    get_calls: AtomicU32,
    write_calls: AtomicU32,
    fail: AtomicBool,
  }

  impl FakeApi {
    fn check(&self) -> Result<()> {
      if self.fail.load(Ordering::SeqCst) {
        Err(eyre!("HTTP status server error (503 Service Unavailable)"))
      } else {
        Ok(())
      }
    }
  }

  fn task(id: u32) -> Task {
    Task {
      id: id.to_string(),
      name: format!("task {}", id),
      complete: id % 2 == 0,
    }
  }

  #[async_trait]
  impl TaskApi for FakeApi {
    async fn list(&self, page: u32, limit: u32) -> Result<Vec<Task>> {
      self.list_calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.check()?;
      let start = (page - 1) * limit + 1;
      Ok((start..start + limit).map(task).collect())
    }

    async fn get(&self, id: &str) -> Result<Task> {
      self.get_calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.check()?;
      Ok(Task {
        id: id.to_string(),
        name: format!("task {}", id),
        complete: false,
      })
    }

    async fn create(&self, task: &NewTask) -> Result<Task> {
      self.write_calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.check()?;
      Ok(task.clone().with_id("201"))
    }

    async fn update(&self, task: &Task) -> Result<Task> {
      self.write_calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.check()?;
      Ok(task.clone())
    }

    async fn delete(&self, _id: &str) -> Result<()> {
      self.write_calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.check()
    }
  }

  fn client() -> (CachedTaskClient<FakeApi>, Arc<MemorySlotStorage>) {
    let storage = Arc::new(MemorySlotStorage::new());
    let cache = CacheLayer::new(
      CacheConfig::default(),
      PersistenceAdapter::new(storage.clone(), DEFAULT_SLOT),
    );
    (CachedTaskClient::new(FakeApi::default(), cache), storage)
  }

  #[tokio::test(start_paused = true)]
  async fn test_list_cached_then_invalidated_by_update() {
    let (client, _) = client();

    let first = client.list(1, 20).await;
    assert_eq!(first.len(), 20);
    assert_eq!(client.api.list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.cache().keys(), vec!["todos_1_20"]);

    let second = client.list(1, 20).await;
    assert_eq!(second, first);
    assert_eq!(client.api.list_calls.load(Ordering::SeqCst), 1);

    let mut seventh = first[6].clone();
    seventh.complete = !seventh.complete;
    client.update(seventh).await;

    client.list(1, 20).await;
    assert_eq!(client.api.list_calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_lists_share_one_call() {
    let (client, _) = client();

    let (a, b, c) = tokio::join!(client.list(1, 20), client.list(1, 20), client.list(1, 20));
    assert_eq!(client.api.list_calls.load(Ordering::SeqCst), 1);
    assert_eq!(a, b);
    assert_eq!(b, c);
  }

  #[tokio::test(start_paused = true)]
  async fn test_different_pages_are_separate_entries() {
    let (client, _) = client();

    let page_one = client.list(1, 10).await;
    let page_two = client.list(2, 10).await;
    assert_eq!(page_one[0].id, "1");
    assert_eq!(page_two[0].id, "11");
    assert_eq!(client.api.list_calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_list_failure_falls_back_to_empty() {
    let (client, _) = client();
    client.api.fail.store(true, Ordering::SeqCst);

    assert!(client.list(1, 20).await.is_empty());
    assert!(client.cache().is_empty());

    // Nothing cached, so the next call goes to the network again
    client.api.fail.store(false, Ordering::SeqCst);
    assert_eq!(client.list(1, 20).await.len(), 20);
    assert_eq!(client.api.list_calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_failure_falls_back_to_none() {
    let (client, _) = client();
    client.api.fail.store(true, Ordering::SeqCst);

    assert_eq!(client.get("5").await, None);
    assert!(client.cache().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_is_cached() {
    let (client, _) = client();

    let first = client.get("5").await.unwrap();
    let second = client.get("5").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(client.api.get_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_invalidates_lists_only() {
    let (client, _) = client();
    client.list(1, 20).await;
    client.get("5").await;

    let created = client.create(NewTask::new("write report")).await.unwrap();
    assert!(created.id.starts_with("server-"));
    assert_eq!(created.name, "write report");
    assert!(!created.complete);
    assert_eq!(client.cache().keys(), vec!["todo_5"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_and_delete_invalidate_item_and_lists() {
    let (client, _) = client();
    client.list(1, 20).await;
    client.list(2, 20).await;
    client.get("5").await;
    client.get("6").await;

    client.update(task(5)).await;
    assert_eq!(client.cache().keys(), vec!["todo_6"]);

    client.list(1, 20).await;
    client.delete("6").await;
    assert!(client.cache().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_happens_before_write_settles() {
    let (client, _) = client();
    client.list(1, 20).await;

    let write = client.update(task(7));
    let read = async {
      // The update is still in flight here
      tokio::time::sleep(Duration::from_millis(5)).await;
      client.list(1, 20).await
    };
    let (_, tasks) = tokio::join!(write, read);

    assert_eq!(tasks.len(), 20);
    assert_eq!(client.api.list_calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_failures_fall_back() {
    let (client, _) = client();
    client.api.fail.store(true, Ordering::SeqCst);

    assert_eq!(client.create(NewTask::new("x")).await, None);
    assert_eq!(client.update(task(1)).await, None);
    client.delete("1").await;
    assert_eq!(client.api.write_calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_cache_drops_entries_and_snapshot() {
    let (client, storage) = client();
    client.list(1, 20).await;
    client.cache().flush();
    assert!(storage.contains(DEFAULT_SLOT));

    client.clear_cache();
    assert!(client.cache().is_empty());
    assert!(!storage.contains(DEFAULT_SLOT));

    client.list(1, 20).await;
    assert_eq!(client.api.list_calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cached_lists_survive_restart() {
    let (client, storage) = client();
    let tasks = client.list(1, 20).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let cache = CacheLayer::new(
      CacheConfig::default(),
      PersistenceAdapter::new(storage.clone(), DEFAULT_SLOT),
    );
    let restarted = CachedTaskClient::new(FakeApi::default(), cache);
    assert_eq!(restarted.list(1, 20).await, tasks);
    assert_eq!(restarted.api.list_calls.load(Ordering::SeqCst), 0);
  }
}

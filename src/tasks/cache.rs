//! Cache keys and cached payloads for tasks.

use serde::{Deserialize, Serialize};

use super::types::Task;

/// Prefix shared by every paginated list key.
pub const LIST_PREFIX: &str = "todos";

/// Prefix of single-task keys. Deliberately not a prefix of [`LIST_PREFIX`] keys.
pub const ITEM_PREFIX: &str = "todo_";

/// Logical read requests against the task resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskQueryKey {
  /// One page of the task list
  List { page: u32, limit: u32 },
  /// A single task by id
  Item { id: String },
}

impl TaskQueryKey {
  /// Deterministic cache key. Identical requests always map to the same key.
  pub fn cache_key(&self) -> String {
    match self {
      Self::List { page, limit } => format!("{}_{}_{}", LIST_PREFIX, page, limit),
      Self::Item { id } => format!("{}{}", ITEM_PREFIX, id),
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::List { page, limit } => format!("tasks page {} (limit {})", page, limit),
      Self::Item { id } => format!("task {}", id),
    }
  }
}

/// What the task cache stores under a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskPayload {
  List(Vec<Task>),
  Item(Task),
}

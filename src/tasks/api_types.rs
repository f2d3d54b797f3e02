//! Serde types matching the remote todo resource.
//!
//! The wire schema uses `title`/`completed` and numeric ids; domain types use
//! `name`/`complete` and string ids.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{NewTask, Task};

/// Ids arrive as numbers from the reference server but are accepted as strings too.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ApiId {
  Number(u64),
  Text(String),
}

impl fmt::Display for ApiId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ApiId::Number(n) => write!(f, "{}", n),
      ApiId::Text(s) => f.write_str(s),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiTodo {
  pub id: Option<ApiId>,
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub completed: Option<bool>,
}

impl ApiTodo {
  /// Map to a domain task. A missing title or completion flag falls back to
  /// empty / incomplete; a missing id is an error.
  pub fn into_task(self) -> Result<Task> {
    let id = self
      .id
      .ok_or_else(|| eyre!("Todo response has no id"))?
      .to_string();

    Ok(Task {
      id,
      name: self.title.unwrap_or_default(),
      complete: self.completed.unwrap_or(false),
    })
  }
}

/// Request body for create and update.
#[derive(Debug, Serialize)]
pub struct ApiTodoBody<'a> {
  pub title: &'a str,
  pub completed: bool,
  #[serde(rename = "userId")]
  pub user_id: u64,
}

impl<'a> ApiTodoBody<'a> {
  pub fn from_new(task: &'a NewTask, user_id: u64) -> Self {
    Self {
      title: &task.name,
      completed: task.complete,
      user_id,
    }
  }

  pub fn from_task(task: &'a Task, user_id: u64) -> Self {
    Self {
      title: &task.name,
      completed: task.complete,
      user_id,
    }
  }
}

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, CACHE_CONTROL};
use url::Url;

use crate::config::Config;
use crate::tasks::api_types::{ApiTodo, ApiTodoBody};
use crate::tasks::types::{NewTask, Task};

/// Remote CRUD operations on the task resource.
#[async_trait]
pub trait TaskApi: Send + Sync {
  /// One page of tasks
  async fn list(&self, page: u32, limit: u32) -> Result<Vec<Task>>;

  async fn get(&self, id: &str) -> Result<Task>;

  /// Create a task; the returned task carries whatever id the server assigned
  async fn create(&self, task: &NewTask) -> Result<Task>;

  async fn update(&self, task: &Task) -> Result<Task>;

  async fn delete(&self, id: &str) -> Result<()>;
}

/// HTTP client for the task resource
#[derive(Clone)]
pub struct TaskHttpClient {
  client: reqwest::Client,
  base: Url,
  user_id: u64,
}

impl TaskHttpClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = Url::parse(&config.api_url())
      .map_err(|e| eyre!("Invalid API URL {}: {}", config.api_url(), e))?;

    let client = reqwest::Client::builder()
      .user_agent(concat!("taskcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      user_id: config.api.user_id,
    })
  }

  /// URL of a single item under the collection
  fn item_url(&self, id: &str) -> Result<Url> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| eyre!("API URL {} cannot have path segments", self.base))?
      .pop_if_empty()
      .push(id);
    Ok(url)
  }
}

#[async_trait]
impl TaskApi for TaskHttpClient {
  async fn list(&self, page: u32, limit: u32) -> Result<Vec<Task>> {
    let todos: Vec<ApiTodo> = self
      .client
      .get(self.base.clone())
      .query(&[("page", page), ("limit", limit)])
      .header(CACHE_CONTROL, HeaderValue::from_static("max-age=300"))
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to list todos: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse todo list: {}", e))?;

    todos.into_iter().map(ApiTodo::into_task).collect()
  }

  async fn get(&self, id: &str) -> Result<Task> {
    let todo: ApiTodo = self
      .client
      .get(self.item_url(id)?)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to get todo {}: {}", id, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse todo {}: {}", id, e))?;

    todo.into_task()
  }

  async fn create(&self, task: &NewTask) -> Result<Task> {
    let todo: ApiTodo = self
      .client
      .post(self.base.clone())
      .json(&ApiTodoBody::from_new(task, self.user_id))
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to create todo: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse created todo: {}", e))?;

    todo.into_task()
  }

  async fn update(&self, task: &Task) -> Result<Task> {
    let todo: ApiTodo = self
      .client
      .put(self.item_url(&task.id)?)
      .json(&ApiTodoBody::from_task(task, self.user_id))
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to update todo {}: {}", task.id, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse updated todo {}: {}", task.id, e))?;

    todo.into_task()
  }

  async fn delete(&self, id: &str) -> Result<()> {
    self
      .client
      .delete(self.item_url(id)?)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Failed to delete todo {}: {}", id, e))?;

    Ok(())
  }
}

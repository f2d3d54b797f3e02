//! The remote task resource: wire types, HTTP client and the cached client.

pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod types;

pub use cache::{TaskPayload, TaskQueryKey};
pub use cached_client::CachedTaskClient;
pub use client::{TaskApi, TaskHttpClient};
pub use types::{NewTask, Task};

//! Client-side data access for a remote task list.
//!
//! Reads go through a bounded, expiring, persisted cache and concurrent
//! identical reads share one remote call. Writes invalidate the entries they
//! affect before they are sent.

pub mod cache;
pub mod config;
pub mod tasks;

pub use config::Config;
pub use tasks::{CachedTaskClient, NewTask, Task};

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use taskcache::{CachedTaskClient, Config, NewTask, Task};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskcache")]
#[command(about = "Cached access to a remote task list")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/taskcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to daily files in this directory instead of stderr
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List one page of tasks
  List {
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    page: u32,
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..))]
    limit: u32,
  },
  /// Show a single task
  Get { id: String },
  /// Create a task
  Create {
    name: String,
    #[arg(long)]
    complete: bool,
  },
  /// Replace a task's name and completion state
  Update {
    id: String,
    name: String,
    #[arg(long)]
    complete: bool,
  },
  /// Delete a task
  Delete { id: String },
  /// Drop the in-memory cache and its persisted snapshot
  ClearCache,
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskcache=info"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "taskcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}

fn non_empty(name: String) -> Result<String> {
  if name.trim().is_empty() {
    return Err(eyre!("Task name must not be empty"));
  }
  Ok(name)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let json = serde_json::to_string_pretty(value)
    .map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", json);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_dir.as_deref());

  let config = Config::load(args.config.as_deref())?;
  let client = CachedTaskClient::from_config(&config)?;

  match args.command {
    Command::List { page, limit } => print_json(&client.list(page, limit).await)?,
    Command::Get { id } => print_json(&client.get(&id).await)?,
    Command::Create { name, complete } => {
      let task = NewTask {
        name: non_empty(name)?,
        complete,
      };
      print_json(&client.create(task).await)?
    }
    Command::Update { id, name, complete } => {
      let task = Task {
        id,
        name: non_empty(name)?,
        complete,
      };
      print_json(&client.update(task).await)?
    }
    Command::Delete { id } => client.delete(&id).await,
    Command::ClearCache => client.clear_cache(),
  }

  // Persist the last mutation instead of waiting out the debounce window
  client.cache().flush();

  Ok(())
}

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pwa_sync::cache::{CacheStorage, SqliteStorage};
use pwa_sync::config::Config;
use pwa_sync::db::{Database, Item, NewSyncOp, Operation};
use pwa_sync::net::{HttpNetwork, Request};
use pwa_sync::page::{PageBridge, PageEvent};
use pwa_sync::queue::SyncQueue;
use pwa_sync::worker::{
  BackgroundSync, ClientHandle, ClientHub, EventLoop, LogNotifier, ServiceWorker,
};

#[derive(Parser, Debug)]
#[command(name = "pwa-sync")]
#[command(about = "Offline cache and background sync engine for progressive web apps")]
#[command(version)]
struct Cli {
  /// Path to config file (default: ./pwa-sync.yaml, then $XDG_CONFIG_HOME/pwa-sync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log filter, e.g. "debug" or "pwa_sync=trace" (default: $RUST_LOG or "warn")
  #[arg(long, global = true)]
  log_level: Option<String>,

  /// Treat the device as offline: queued ops wait instead of syncing
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a path through the worker, as an intercepted page request
  Fetch {
    path: String,
    /// Treat it as a top-level navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Precache the app shell and activate
  Install,
  /// Purge caches from other versions
  Activate,
  /// Queue a mutation for replay
  Enqueue {
    entity_type: String,
    entity_id: String,
    operation: Operation,
    /// JSON payload
    #[arg(default_value = "{}")]
    payload: String,
  },
  /// Save or delete items locally and queue their sync
  #[command(subcommand)]
  Item(ItemCommand),
  /// List ops waiting for replay
  Pending,
  /// List ops that exhausted their retries
  DeadLetters,
  /// Move dead-lettered ops back into the live queue
  Requeue,
  /// Replay the pending queue now
  Sync,
  /// Come back online: fire waiting background syncs and print page events
  Reconnect,
  /// List cache partitions
  Caches,
  /// Simulate an inbound push message
  Push { payload: String },
}

#[derive(Subcommand, Debug)]
enum ItemCommand {
  Save {
    id: String,
    name: String,
    #[arg(long)]
    description: Option<String>,
  },
  Delete { id: String },
  List,
}

fn init_logging(filter: Option<&str>, log_dir: &Path) -> Result<WorkerGuard> {
  let filter = match filter {
    Some(f) => EnvFilter::try_new(f).unwrap_or_else(|_| EnvFilter::new("warn")),
    None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
  };

  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "pwa-sync.log"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer),
    )
    .init();

  Ok(guard)
}

/// The CLI's own window: a connected client and its page-side bridge.
struct Page {
  bridge: PageBridge,
  events: mpsc::UnboundedReceiver<PageEvent>,
  handle: ClientHandle,
}

impl Page {
  fn print_events(&mut self) -> Result<()> {
    while let Ok(event) = self.events.try_recv() {
      print_json(&event)?;
    }
    Ok(())
  }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", json);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let cli = Cli::parse();
  let config = Arc::new(Config::load(cli.config.as_deref())?);

  let database_path = config.database_path()?;
  let data_dir = database_path
    .parent()
    .ok_or_else(|| eyre!("Database path has no parent: {}", database_path.display()))?
    .to_path_buf();
  let _guard = init_logging(cli.log_level.as_deref(), &data_dir)?;

  let db = Arc::new(Database::open(&database_path)?);
  let storage = Arc::new(SqliteStorage::open(&config.cache_path()?)?);
  let network = Arc::new(HttpNetwork::new(&config)?);
  let worker = ServiceWorker::new(
    config.clone(),
    storage.clone(),
    network,
    db.clone(),
    Arc::new(ClientHub::new()),
    Arc::new(LogNotifier),
  )?;

  // Queue writes register a background sync that the event loop delivers
  // back to the worker once online.
  let (events, event_loop) = EventLoop::new();
  let start_online = !cli.offline && !matches!(cli.command, Command::Reconnect);
  let background = Arc::new(BackgroundSync::new(events, start_online));
  let queue = SyncQueue::new(db.clone(), config.sync.tag.clone()).with_registrar(background);
  let runner = tokio::spawn(event_loop.run(worker.clone()));

  let (bridge, page_events) = PageBridge::new(queue.clone());
  let page = Page {
    bridge,
    events: page_events,
    handle: worker.clients().connect(worker.resolve("/")?),
  };

  let outcome = run(cli.command, &worker, &queue, page, &db, storage.as_ref()).await;

  // Dropping the last sender lets the loop drain and stop; the page's
  // bridge held one and went away with `run`
  drop(queue);
  runner
    .await
    .map_err(|e| eyre!("Worker event loop failed: {}", e))?;

  outcome
}

async fn run(
  command: Command,
  worker: &ServiceWorker<SqliteStorage>,
  queue: &SyncQueue,
  mut page: Page,
  db: &Database,
  storage: &SqliteStorage,
) -> Result<()> {
  match command {
    Command::Fetch { path, navigate } => {
      let url = worker.resolve(&path)?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };

      let result = worker.respond(request).await?;
      eprintln!("{} ({})", result.data.status, result.source);
      println!("{}", result.data.text());
      worker.wait_idle().await;
    }
    Command::Install => {
      // Caches from another version mean an older worker already serves pages
      let had_controller = worker.clients().has_controller()
        || storage
          .partitions()?
          .iter()
          .any(|p| !worker.names().is_current(&p.name));

      let report = worker.install().await;
      for path in &report.cached {
        println!("cached  {}", path);
      }
      for (path, reason) in &report.failed {
        println!("failed  {} ({})", path, reason);
      }
      println!("state   {}", worker.state());
      page.bridge.on_worker_installed(had_controller);
      page.print_events()?;
    }
    Command::Activate => {
      let report = worker.activate().await;
      for name in &report.deleted {
        println!("deleted {}", name);
      }
    }
    Command::Enqueue {
      entity_type,
      entity_id,
      operation,
      payload,
    } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let op = queue
        .enqueue(NewSyncOp::new(entity_type, entity_id, operation, payload))
        .await?;
      print_json(&op)?;
    }
    Command::Item(ItemCommand::Save {
      id,
      name,
      description,
    }) => {
      let (item, operation) = match db.get_item(&id)? {
        Some(mut existing) => {
          existing.name = name;
          existing.description = description.or(existing.description);
          (existing, Operation::Update)
        }
        None => {
          let mut item = Item::new(id, name);
          item.description = description;
          (item, Operation::Create)
        }
      };
      let (saved, _) = queue.save_item(&item, operation).await?;
      print_json(&saved)?;
    }
    Command::Item(ItemCommand::Delete { id }) => {
      let item = db
        .get_item(&id)?
        .ok_or_else(|| eyre!("No item with id '{}'", id))?;
      let (_, op) = queue.save_item(&item, Operation::Delete).await?;
      print_json(&op)?;
    }
    Command::Item(ItemCommand::List) => print_json(&db.list_items()?)?,
    Command::Pending => print_json(&queue.list_pending()?)?,
    Command::DeadLetters => print_json(&queue.list_dead_letters()?)?,
    Command::Requeue => {
      let count = queue.requeue_dead_letters().await?;
      println!("requeued {}", count);
    }
    Command::Sync => print_json(&worker.sync_pending_ops(None).await)?,
    Command::Reconnect => {
      page.bridge.on_connection_change(true).await;
      // The fired sync reports back to every window, this one included
      if let Some(message) = page.handle.messages.recv().await {
        page.bridge.on_worker_message(&message);
      }
      page.print_events()?;
    }
    Command::Caches => {
      for partition in storage.partitions()? {
        let marker = if worker.names().is_current(&partition.name) {
          "*"
        } else {
          " "
        };
        println!("{} {} ({} entries)", marker, partition.name, partition.entries);
      }
    }
    Command::Push { payload } => match worker.handle_push(Some(payload.as_bytes())).await {
      Some(notification) => print_json(&notification)?,
      None => println!("empty push ignored"),
    },
  }

  Ok(())
}

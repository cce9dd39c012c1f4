use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;

use feedsync::storage::{Database, DatabaseError, ItemState};
use feedsync::sync::WriteOutcome;
use feedsync::task::TaskEvent;
use feedsync::{Config, SyncEngine, TaskKey, TaskOutcome};

/// Listener key used by the CLI for progress output.
const CLI_LISTENER: u64 = 1;

/// Get the config directory path (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsync"))
}

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Synchronize RSS and Atom feeds into a local store")]
struct Args {
    /// Config file (default: ~/.config/feedsync/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file (default: ~/.config/feedsync/feeds.db)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed URL
    Subscribe {
        url: String,
        /// Category name, created if missing
        #[arg(long)]
        category: Option<String>,
    },
    /// Remove a channel and its items
    Unsubscribe { channel_id: i64 },
    /// List channels
    List,
    /// List the items of a channel
    Items { channel_id: i64 },
    /// Update the given channels, or all of them
    Update { channel_ids: Vec<i64> },
    /// Download an item's enclosure
    Download { channel_id: i64, item_id: i64 },
    /// Subscribe to every feed in an OPML file
    Import { file: PathBuf },
    /// Set an item's reading state
    Mark {
        channel_id: i64,
        item_id: i64,
        state: StateArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StateArg {
    New,
    Read,
    Opened,
}

impl From<StateArg> for ItemState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::New => ItemState::New,
            StateArg::Read => ItemState::Read,
            StateArg::Opened => ItemState::Opened,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // SEC-007: User-only access to the config directory
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(path = %config_dir.display(), error = %e, "Failed to set config directory permissions");
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;
    if config.download_dir.is_none() {
        config.download_dir = Some(config_dir.join("enclosures"));
    }
    let max_concurrent = config.max_concurrent_tasks.max(1);

    let db_path = args.db.clone().unwrap_or_else(|| config_dir.join("feeds.db"));
    let db_path = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    let db = match Database::open(db_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another feedsync instance appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(e).context("Failed to open database"),
    };
    let engine = SyncEngine::new(db, config).context("Failed to build HTTP client")?;

    tokio::select! {
        result = run(&engine, args.command, max_concurrent) => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, stopping tasks...");
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn run(engine: &SyncEngine, command: Command, max_concurrent: usize) -> Result<()> {
    match command {
        Command::Subscribe { url, category } => {
            let category_id = match category {
                Some(name) => Some(engine.context().db.ensure_category(&name).await?),
                None => None,
            };
            let id = engine.subscribe_channel(&url, category_id).await?;
            println!("Subscribed: channel {}", id);
        }
        Command::Unsubscribe { channel_id } => {
            if engine.unsubscribe_channel(channel_id).await? {
                println!("Removed channel {}", channel_id);
            } else {
                println!("No channel {}", channel_id);
            }
        }
        Command::List => {
            let categories = engine.categories().await?;
            for channel in engine.channels().await? {
                let (total, unread) = engine.context().db.item_counts(channel.id).await?;
                let category = categories
                    .iter()
                    .find(|c| c.id == channel.category_id)
                    .map_or("?", |c| c.name.as_str());
                println!(
                    "{:>5}  {:<40}  {:>4}/{:<4}  [{}]  {}",
                    channel.id, channel.title, unread, total, category, channel.url
                );
            }
        }
        Command::Items { channel_id } => {
            for item in engine.items(channel_id).await? {
                let marker = match item.state {
                    ItemState::New => '*',
                    ItemState::Read => ' ',
                    ItemState::Opened => '.',
                };
                let downloaded = if item.downloaded { "D" } else { " " };
                println!(
                    "{} {} {:>6}  {}  {}",
                    marker,
                    downloaded,
                    item.id,
                    item.title,
                    item.pub_date.as_deref().unwrap_or("")
                );
            }
        }
        Command::Update { channel_ids } => {
            let ids = if channel_ids.is_empty() {
                engine.channels().await?.into_iter().map(|c| c.id).collect()
            } else {
                channel_ids
            };

            let results: Vec<(i64, Option<TaskOutcome>)> = stream::iter(ids)
                .map(|id| async move {
                    let key = TaskKey::update(id);
                    if let Err(e) = engine.request_channel_update(id) {
                        eprintln!("channel {}: {}", id, e);
                        return (id, None);
                    }
                    let outcome = engine.wait(key).await;
                    engine.consume(key);
                    (id, outcome)
                })
                .buffer_unordered(max_concurrent)
                .collect()
                .await;

            for (id, outcome) in results {
                match outcome {
                    Some(TaskOutcome::Success) => println!("channel {}: updated", id),
                    Some(TaskOutcome::Cancelled) => println!("channel {}: cancelled", id),
                    Some(TaskOutcome::Failed(kind)) => println!("channel {}: failed ({})", id, kind),
                    None => {}
                }
            }
        }
        Command::Download {
            channel_id,
            item_id,
        } => {
            let key = TaskKey::download(item_id);
            engine
                .request_item_download(channel_id, item_id)
                .with_context(|| format!("Cannot start download of item {}", item_id))?;

            if let Some(mut rx) = engine.subscribe(key, CLI_LISTENER) {
                while let Some(event) = rx.recv().await {
                    match event {
                        TaskEvent::Progress { done, total } => {
                            eprint!("\r{:>3}%", done.saturating_mul(100) / total.max(1));
                        }
                        TaskEvent::PostRun(_) => eprintln!(),
                        TaskEvent::PreRun => {}
                    }
                }
            }

            let outcome = engine.wait(key).await;
            engine.consume(key);
            match outcome {
                Some(TaskOutcome::Success) => println!("Downloaded item {}", item_id),
                Some(TaskOutcome::Cancelled) => println!("Download cancelled"),
                Some(TaskOutcome::Failed(kind)) => anyhow::bail!("Download failed: {}", kind),
                None => {}
            }
        }
        Command::Import { file } => {
            // SEC-008: Canonicalize to resolve symlinks
            let canonical = file
                .canonicalize()
                .with_context(|| format!("Failed to resolve import file: {}", file.display()))?;
            if !std::fs::metadata(&canonical)?.is_file() {
                anyhow::bail!("Import path must be a regular file");
            }
            let path = canonical
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in import path"))?;

            let summary = engine
                .import_opml(path)
                .await
                .context("Failed to import OPML file")?;
            println!(
                "Imported {} feeds ({} already subscribed)",
                summary.added, summary.existing
            );
        }
        Command::Mark {
            channel_id,
            item_id,
            state,
        } => match engine.set_item_state(channel_id, item_id, state.into()).await? {
            WriteOutcome::Applied => println!("Item {} marked {:?}", item_id, state),
            WriteOutcome::Deferred => println!("Channel is updating, change queued"),
            WriteOutcome::Missing => anyhow::bail!("No item {} in channel {}", item_id, channel_id),
        },
    }
    Ok(())
}

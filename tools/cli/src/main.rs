//! Outpost CLI - Command line interface for the offline mutation queue.
//!
//! This tool queues mutations in a local SQLite database, inspects the
//! queue and cache, and replays pending mutations against an HTTP backend.

mod http;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use outpost_app::{
    ClientConfig, DrainOutcome, MutationId, OfflineClient, OperationKind, SyncSummary, Target,
};
use outpost_storage::StoreConfig;

use crate::http::{HttpProbe, HttpRemote};

#[derive(Parser)]
#[command(name = "outpost")]
#[command(about = "Outpost - Offline mutation queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// SQLite database holding the queue, cache and settings.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON client configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base URL of the remote service.
    #[arg(short, long, global = true, default_value = "http://127.0.0.1:8080/")]
    remote: Url,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a mutation for replay.
    Enqueue {
        /// Operation: "create", "update", "delete", or a custom kind.
        #[arg(short, long)]
        op: String,

        /// Collection the mutation applies to.
        #[arg(short = 'C', long)]
        collection: String,

        /// Record id within the collection.
        #[arg(short, long)]
        id: Option<String>,

        /// Inline payload.
        #[arg(short, long, conflicts_with = "file")]
        data: Option<String>,

        /// Read the payload from a file.
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// List pending mutations in replay order.
    Pending,

    /// Show connectivity, queue depth and storage usage.
    Status {
        /// Skip the reachability probe.
        #[arg(long)]
        offline: bool,
    },

    /// Probe the remote service and drain the queue if it is reachable.
    Sync,

    /// List or dismiss mutations that failed permanently.
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// Inspect or modify cached reads.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Read or write user settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// Show every unacknowledged dead letter.
    List,

    /// Dismiss one dead letter.
    Ack { id: String },

    /// Dismiss all dead letters.
    Clear,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Store a value.
    Put { key: String, value: String },

    /// Print a value.
    Get {
        key: String,

        /// Only print the value if it is younger than this many seconds.
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Check whether a value is older than the given age.
    Stale {
        key: String,

        #[arg(long)]
        max_age_ms: u64,
    },

    /// Evict entries past the configured horizon.
    Evict,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print a setting as JSON.
    Get { key: String },

    /// Store a JSON value.
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = open_client(&cli)?;

    match cli.command {
        Commands::Enqueue {
            op,
            collection,
            id,
            data,
            file,
        } => cmd_enqueue(&client, &op, collection, id, data, file.as_deref()).await,

        Commands::Pending => cmd_pending(&client).await,

        Commands::Status { offline } => cmd_status(&client, offline).await,

        Commands::Sync => cmd_sync(&client).await,

        Commands::DeadLetters { action } => cmd_dead_letters(&client, action).await,

        Commands::Cache { action } => cmd_cache(&client, action).await,

        Commands::Settings { action } => cmd_settings(&client, action).await,
    }
}

/// Default database location under the user's data directory.
fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_local_dir()
        .context("No local data directory on this platform; pass --db")?
        .join("outpost");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir.join("outpost.db"))
}

/// Build a client over the SQLite database and HTTP backend.
fn open_client(cli: &Cli) -> Result<OfflineClient> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClientConfig::default(),
    };

    let db = match &cli.db {
        Some(db) => db.clone(),
        None => default_db_path()?,
    };
    config.store = StoreConfig::sqlite(db.to_string_lossy());

    let timeout = config.monitor.probe_timeout();
    let probe = HttpProbe::new(cli.remote.clone(), timeout)?;
    let remote = HttpRemote::new(cli.remote.clone(), Duration::from_secs(30))?;

    let client = OfflineClient::builder(config)
        .with_probe(Arc::new(probe))
        .with_remote(Arc::new(remote))
        .build()
        .with_context(|| format!("Failed to open {}", db.display()))?;

    Ok(client)
}

/// Queue a mutation.
async fn cmd_enqueue(
    client: &OfflineClient,
    op: &str,
    collection: String,
    id: Option<String>,
    data: Option<String>,
    file: Option<&Path>,
) -> Result<()> {
    let operation = OperationKind::parse(op).context("Invalid operation")?;
    let target = match id {
        Some(id) => Target::record(collection, id),
        None => Target::collection(collection),
    };

    let payload = match (data, file) {
        (Some(data), _) => data.into_bytes(),
        (None, Some(file)) => tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?,
        (None, None) => Vec::new(),
    };

    info!("Queueing {} {}", operation, target);
    let id = client
        .enqueue_mutation(operation, target, payload)
        .await
        .context("Failed to queue mutation")?;

    println!("Queued {}", id);
    println!("  Pending: {}", client.get_queue_depth().await?);

    Ok(())
}

/// List pending mutations.
async fn cmd_pending(client: &OfflineClient) -> Result<()> {
    let pending = client.pending_mutations().await?;

    if pending.is_empty() {
        println!("No pending mutations.");
        return Ok(());
    }

    println!("{} pending mutation(s):", pending.len());
    for mutation in pending {
        println!(
            "  {}  {:<8} {:<30} {} bytes  attempts {}/{}  queued {}",
            mutation.id,
            mutation.operation.to_string(),
            mutation.target.to_string(),
            mutation.payload.len(),
            mutation.retry_count,
            mutation.max_retries,
            mutation.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show client status.
async fn cmd_status(client: &OfflineClient, offline: bool) -> Result<()> {
    if !offline {
        client.check_connectivity().await;
    }

    let status = client.status().await;
    let usage = client.storage_usage().await?;

    println!("Outpost Status:");
    println!(
        "  Connectivity: {}",
        if status.is_online { "online" } else { "offline" }
    );
    if let Some(offline_for) = status.offline_duration {
        println!("  Offline for: {}s", offline_for.as_secs());
    }
    match status.pending {
        Some(pending) => println!("  Pending: {}", pending),
        None => println!("  Pending: unknown (storage unavailable)"),
    }
    match status.failed {
        Some(failed) => println!("  Failed permanently: {}", failed),
        None => println!("  Failed permanently: unknown (storage unavailable)"),
    }
    println!("  Storage:");
    println!("    Queue: {} bytes", usage.queue);
    println!("    Dead letters: {} bytes", usage.dead_letters);
    println!("    Cache: {} bytes", usage.cache);
    println!("    Settings: {} bytes", usage.settings);
    println!("    Total: {} bytes", usage.total());

    Ok(())
}

/// Drain the queue once.
async fn cmd_sync(client: &OfflineClient) -> Result<()> {
    let connectivity = client.check_connectivity().await;
    if !connectivity.is_online {
        println!("Remote service unreachable; mutations stay queued.");
        return Ok(());
    }

    match client.request_sync_now().await.context("Drain failed")? {
        DrainOutcome::Completed(summary) => print_summary(&summary),
        DrainOutcome::AlreadyRunning => println!("A drain is already running."),
        DrainOutcome::Offline => println!("Went offline before the drain started."),
    }

    println!("  Pending: {}", client.get_queue_depth().await?);

    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!("Drain completed in {:?}:", summary.duration);
    println!("  Succeeded: {}", summary.succeeded);
    println!("  Retried: {}", summary.retried);
    println!("  Failed permanently: {}", summary.dead_lettered_count());
    for dead in &summary.dead_lettered {
        println!(
            "    {} {} {} after {} attempt(s): {}",
            dead.mutation.id, dead.mutation.operation, dead.mutation.target, dead.attempts, dead.reason
        );
    }
    if summary.remaining > 0 {
        println!("  Left for next drain: {}", summary.remaining);
    }
    if let Some(err) = &summary.storage_error {
        println!("  Storage error: {}", err);
    }
}

/// Dead-letter subcommands.
async fn cmd_dead_letters(client: &OfflineClient, action: DeadLetterAction) -> Result<()> {
    match action {
        DeadLetterAction::List => {
            let letters = client.dead_letters().await?;
            if letters.is_empty() {
                println!("No failed mutations.");
                return Ok(());
            }

            println!("{} failed mutation(s):", letters.len());
            for letter in letters {
                println!(
                    "  {}  {:<8} {:<30} attempts {}  failed {}  {}",
                    letter.mutation.id,
                    letter.mutation.operation.to_string(),
                    letter.mutation.target.to_string(),
                    letter.attempts,
                    letter.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    letter.reason
                );
            }
        }

        DeadLetterAction::Ack { id } => {
            let id = MutationId::new(id).context("Invalid mutation id")?;
            if client.acknowledge_dead_letter(&id).await? {
                println!("Dismissed {}", id);
            } else {
                println!("No dead letter {}", id);
            }
        }

        DeadLetterAction::Clear => {
            let removed = client.clear_dead_letters().await?;
            println!("Dismissed {} dead letter(s)", removed);
        }
    }

    Ok(())
}

/// Cache subcommands.
async fn cmd_cache(client: &OfflineClient, action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Put { key, value } => {
            client.cache_store(&key, value.into_bytes()).await?;
            println!("Cached {}", key);
        }

        CacheAction::Get { key, max_age_secs } => {
            let value = match max_age_secs {
                Some(secs) => {
                    client
                        .cache_load_fresh(&key, Duration::from_secs(secs))
                        .await?
                }
                None => client.cache_load(&key).await?,
            };
            match value {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("No cached value for {}", key),
            }
        }

        CacheAction::Stale { key, max_age_ms } => {
            let stale = client
                .cache_is_stale(&key, Duration::from_millis(max_age_ms))
                .await?;
            println!("{}", if stale { "stale" } else { "fresh" });
        }

        CacheAction::Evict => {
            let removed = client.cache_evict().await?;
            println!("Evicted {} entries", removed);
        }
    }

    Ok(())
}

/// Settings subcommands.
async fn cmd_settings(client: &OfflineClient, action: SettingsAction) -> Result<()> {
    match action {
        SettingsAction::Get { key } => {
            match client.get_setting::<serde_json::Value>(&key).await? {
                Some(value) => println!("{}", value),
                None => println!("{} is not set", key),
            }
        }

        SettingsAction::Set { key, value } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).context("Setting value must be JSON")?;
            client.set_setting(&key, &value).await?;
            println!("Set {}", key);
        }
    }

    Ok(())
}

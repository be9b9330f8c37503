//! FieldSync CLI - Command line interface for the local survey store.
//!
//! This tool loads master data, walks records through their lifecycle,
//! shows dashboard counters and runs sync cycles against the backend.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use fieldsync_common::{
    Category, CounterScope, RecordFilter, RecordId, RecordStatus, SurveyRecord,
};
use fieldsync_storage::{parse_batch, BatchImporter, CounterAggregator, LocalStore, SyncQueueSelector};
use fieldsync_sync::{
    ConnectivityProbe, EngineConfig, HttpProbe, HttpSubmissionClient, NetworkMonitor, SyncMode,
    SyncOrchestrator, SyncOutcome, SyncRequest, SyncScheduler,
};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Offline-first survey storage and sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform data directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and write a configuration file.
    Init {
        /// Backend base URL records are submitted to.
        #[arg(short, long)]
        endpoint: Option<Url>,
    },

    /// Replace a category's records with a JSON array from a file.
    Import {
        /// Category: "consumer_indexing" or "meter_installation".
        #[arg(short, long)]
        category: Category,

        /// JSON file holding the records.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List records.
    List {
        /// Only this category.
        #[arg(short, long)]
        category: Option<Category>,

        /// Only this status.
        #[arg(short, long)]
        status: Option<RecordStatus>,
    },

    /// Mark a record as completed.
    Complete {
        /// Record identifier.
        #[arg(short, long)]
        id: String,
    },

    /// Queue a completed record for sync.
    Queue {
        /// Record identifier.
        #[arg(short, long)]
        id: String,
    },

    /// Show records waiting for sync, in submission order.
    Pending {
        #[arg(short, long)]
        category: Option<Category>,
    },

    /// Show dashboard counters.
    Counters {
        /// Recompute from the records before printing.
        #[arg(short, long)]
        recompute: bool,
    },

    /// Run one sync cycle.
    Sync {
        /// Only sync this category.
        #[arg(short, long)]
        category: Option<Category>,
    },

    /// Keep syncing according to the configured sync mode until interrupted.
    Watch,

    /// Delete every record and reset the counters.
    Clear {
        /// Confirm deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Print the effective configuration.
    Config,
}

/// Store and counters opened from a configuration.
struct Engine {
    config: EngineConfig,
    store: Arc<LocalStore>,
    counters: Arc<CounterAggregator>,
}

impl Engine {
    async fn open(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(LocalStore::open(&config.database_path));
        store.initialize().await.with_context(|| {
            format!("Failed to open database {}", config.database_path.display())
        })?;
        let counters = Arc::new(CounterAggregator::new(store.clone()));
        Ok(Self {
            config,
            store,
            counters,
        })
    }

    /// Monitor seeded with a first probe result, plus the probe itself.
    async fn network(&self) -> Result<(Arc<NetworkMonitor>, Arc<dyn ConnectivityProbe>)> {
        let url = self
            .config
            .effective_probe_url()
            .context("No endpoint configured; run `fieldsync init --endpoint <url>`")?;
        let probe: Arc<dyn ConnectivityProbe> =
            Arc::new(HttpProbe::new(url.clone(), Duration::from_secs(5))?);
        let monitor = Arc::new(NetworkMonitor::new(probe.probe().await));
        Ok((monitor, probe))
    }

    fn orchestrator(
        &self,
        network: Arc<NetworkMonitor>,
    ) -> Result<SyncOrchestrator<HttpSubmissionClient>> {
        let endpoint = self
            .config
            .endpoint
            .clone()
            .context("No endpoint configured; run `fieldsync init --endpoint <url>`")?;
        let client = HttpSubmissionClient::new(endpoint, self.config.sync.submission_timeout)?;
        Ok(SyncOrchestrator::new(
            self.store.clone(),
            self.counters.clone(),
            network,
            client,
            self.config.sync.clone(),
        ))
    }
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

    let config_path = cli.config.unwrap_or_else(EngineConfig::default_path);

    match cli.command {
        Commands::Init { endpoint } => cmd_init(&config_path, endpoint).await,
        Commands::Config => cmd_config(&config_path).await,
        Commands::Import { category, file } => {
            cmd_import(&open(&config_path).await?, category, &file).await
        }
        Commands::List { category, status } => {
            cmd_list(&open(&config_path).await?, category, status).await
        }
        Commands::Complete { id } => cmd_complete(&open(&config_path).await?, &id).await,
        Commands::Queue { id } => cmd_queue(&open(&config_path).await?, &id).await,
        Commands::Pending { category } => cmd_pending(&open(&config_path).await?, category).await,
        Commands::Counters { recompute } => {
            cmd_counters(&open(&config_path).await?, recompute).await
        }
        Commands::Sync { category } => cmd_sync(&open(&config_path).await?, category).await,
        Commands::Watch => cmd_watch(&open(&config_path).await?).await,
        Commands::Clear { yes } => cmd_clear(&open(&config_path).await?, yes).await,
    }
}

/// Load the configuration and open its database.
async fn open(config_path: &Path) -> Result<Engine> {
    let config = EngineConfig::load_or_default(config_path)
        .await
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    Engine::open(config).await
}

/// Write a configuration file and create the database.
async fn cmd_init(config_path: &Path, endpoint: Option<Url>) -> Result<()> {
    let mut config = EngineConfig::load_or_default(config_path).await?;
    if endpoint.is_some() {
        config.endpoint = endpoint;
    }
    config
        .save(config_path)
        .await
        .context("Failed to write configuration")?;

    let engine = Engine::open(config).await?;
    engine.counters.recompute_all().await?;

    println!("Initialized FieldSync");
    println!("  Config: {}", config_path.display());
    println!("  Database: {}", engine.config.database_path.display());
    match &engine.config.endpoint {
        Some(url) => println!("  Endpoint: {}", url),
        None => println!("  Endpoint: (none, sync disabled)"),
    }

    Ok(())
}

async fn cmd_config(config_path: &Path) -> Result<()> {
    let config = EngineConfig::load_or_default(config_path).await?;
    println!("{}", config.to_json()?);
    Ok(())
}

/// Replace a category from a JSON file.
async fn cmd_import(engine: &Engine, category: Category, file: &Path) -> Result<()> {
    info!("Importing {} records from {}", category, file.display());

    let json = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let records = parse_batch(&json).context("Invalid import file")?;

    let importer = BatchImporter::new(engine.store.clone(), engine.counters.clone());
    let inserted = importer
        .insert_batch(category, &records)
        .await
        .context("Import rejected; existing records were kept")?;

    println!("Imported {} {} records.", inserted, category);
    Ok(())
}

async fn cmd_list(
    engine: &Engine,
    category: Option<Category>,
    status: Option<RecordStatus>,
) -> Result<()> {
    let filter = RecordFilter { category, status };
    let records = engine.store.query_records(filter).await?;

    if records.is_empty() {
        println!("No records.");
    } else {
        for record in &records {
            print_record(record);
        }
        println!("{} record(s).", records.len());
    }

    Ok(())
}

async fn cmd_complete(engine: &Engine, id: &str) -> Result<()> {
    let mut record = find(engine, id).await?;
    record.status = RecordStatus::Completed;
    let saved = engine
        .store
        .upsert_record(&record)
        .await
        .context("Failed to complete record")?;
    engine.counters.recompute(saved.category).await?;

    println!("{} is now {}.", saved.id, saved.status);
    Ok(())
}

async fn cmd_queue(engine: &Engine, id: &str) -> Result<()> {
    let record = find(engine, id).await?;
    let saved = engine
        .store
        .update_status(&record.id, RecordStatus::ToSync)
        .await
        .context("Failed to queue record")?;
    engine.counters.recompute(saved.category).await?;

    println!("{} queued for sync.", saved.id);
    Ok(())
}

async fn cmd_pending(engine: &Engine, category: Option<Category>) -> Result<()> {
    let queue = SyncQueueSelector::new(engine.store.clone());
    let records = queue.pending_records(category).await?;

    if records.is_empty() {
        println!("Nothing pending.");
        return Ok(());
    }

    for (position, record) in records.iter().enumerate() {
        print!("{:>4}. ", position + 1);
        print_record(record);
    }
    Ok(())
}

async fn cmd_counters(engine: &Engine, recompute: bool) -> Result<()> {
    if recompute {
        engine.counters.recompute_all().await?;
    }

    println!(
        "{:<20} {:>8} {:>8} {:>9} {:>8} {:>8} {:>8} {:>10}",
        "scope", "assigned", "draft", "completed", "to_sync", "synced", "total", "done"
    );
    for scope in CounterScope::all() {
        let c = engine.counters.counters(scope).await?;
        println!(
            "{:<20} {:>8} {:>8} {:>9} {:>8} {:>8} {:>8} {:>10}",
            scope.key(),
            c.assigned,
            c.draft,
            c.completed,
            c.to_sync,
            c.synced,
            c.total,
            c.total_completed
        );
    }
    Ok(())
}

/// Run one sync cycle and report the outcome.
async fn cmd_sync(engine: &Engine, category: Option<Category>) -> Result<()> {
    let (network, _) = engine.network().await?;
    if !network.current_state().can_submit() {
        println!("Backend unreachable; pending records will be retried next time.");
    }

    let orchestrator = engine.orchestrator(network)?;
    let outcome = match category {
        Some(category) => orchestrator.run_sync_category(category).await,
        None => orchestrator.run_sync().await,
    }
    .context("Sync aborted")?;

    print_outcome(&outcome);
    Ok(())
}

/// Run the scheduler until Ctrl-C.
async fn cmd_watch(engine: &Engine) -> Result<()> {
    let mode = engine.config.sync_mode.clone();
    if mode == SyncMode::Manual {
        anyhow::bail!("sync_mode is manual; set it to OnReconnect, Periodic or Hybrid to watch");
    }

    let (network, probe) = engine.network().await?;
    let orchestrator = Arc::new(engine.orchestrator(network.clone())?);
    let polling = network.spawn_polling(probe, engine.config.probe_interval);

    let (scheduler, handle) = SyncScheduler::new(mode, Some(network));
    let task = tokio::spawn(handle.run(move |request| {
        let orchestrator = orchestrator.clone();
        async move {
            match request {
                SyncRequest::Category(category) => orchestrator.run_sync_category(category).await,
                _ => orchestrator.run_sync().await,
            }
        }
    }));

    info!("Watching for sync triggers, press Ctrl-C to stop");
    let outcome = scheduler.request_sync().await?;
    print_outcome(&outcome);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;
    polling.abort();
    Ok(())
}

async fn cmd_clear(engine: &Engine, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to delete all records without --yes");
    }
    engine.store.clear_all().await?;
    println!("All records deleted.");
    Ok(())
}

async fn find(engine: &Engine, id: &str) -> Result<SurveyRecord> {
    let id = RecordId::new(id).context("Invalid record id")?;
    engine
        .store
        .get_record(&id)
        .await?
        .with_context(|| format!("Record {} not found", id))
}

fn print_record(record: &SurveyRecord) {
    let error = record
        .last_sync_error
        .as_deref()
        .map(|e| format!("  ({} failed: {})", record.sync_attempts, e))
        .unwrap_or_default();
    println!(
        "{:<12} {:<20} {:<10} {}{}",
        record.id,
        record.category,
        record.status,
        record.modified_at.format("%Y-%m-%d %H:%M:%S"),
        error
    );
}

fn print_outcome(outcome: &SyncOutcome) {
    println!(
        "Sync finished in {:.1}s: {} submitted, {} succeeded, {} failed.",
        outcome.duration.as_secs_f64(),
        outcome.submitted,
        outcome.succeeded,
        outcome.failed
    );
    for failure in &outcome.failures {
        println!("  {}: {}", failure.record_id, failure.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["fieldsync", "sync", "-v", "--config", "/tmp/fieldsync.json"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/fieldsync.json")));
        assert!(matches!(cli.command, Commands::Sync { category: None }));

        let cli = Cli::try_parse_from(["fieldsync", "pending", "-c", "meter_installation"]).unwrap();
        assert!(!cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Pending {
                category: Some(Category::MeterInstallation)
            }
        ));
    }
}

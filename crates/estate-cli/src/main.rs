use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use estate_core::{EntityKind, SyncPassResult, SyncStrategy};
use estate_erp::{ErpSource, StaticSource};
use estate_storage::{MemoryBuildingStore, MemorySnapshotStore};
use estate_sync::{KindStore, SyncConfig, SyncSupervisor, SyncWorker};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "estate-cli")]
#[command(about = "Estate ERP sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the periodic workers and the admin server.
    Serve,
    /// Run one pass per kind and exit.
    Sync {
        #[arg(long, value_delimiter = ',')]
        kind: Vec<EntityKind>,
        /// Read ERP envelopes from `<dir>/<kind>.json` into in-memory stores.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Sync { kind, fixtures } => {
            let kinds = (!kind.is_empty()).then_some(kind);
            let results = match fixtures {
                Some(dir) => sync_fixtures(dir, kinds).await?,
                None => estate_sync::run_sync_once_from_env(kinds).await?,
            };
            for pass in &results {
                print_summary(pass);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = estate_storage::connect_pool(
                &config.database_url,
                config.database_max_connections,
            )
            .await?;
            estate_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn serve() -> Result<()> {
    let config = SyncConfig::from_env();
    info!(?config, "starting estate sync service");

    let pool = estate_storage::connect_pool(&config.database_url, config.database_max_connections)
        .await?;
    estate_storage::run_migrations(&pool).await?;

    let mut supervisor = SyncSupervisor::from_pool(&config, pool, CancellationToken::new())?;
    if config.scheduler_enabled {
        supervisor.start();
    } else {
        info!("periodic sync disabled; manual triggers only");
    }

    estate_web::run_service(&config.bind_addr, supervisor, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "listening for shutdown signal failed");
            std::future::pending::<()>().await;
        }
    })
    .await
}

async fn sync_fixtures(
    dir: PathBuf,
    kinds: Option<Vec<EntityKind>>,
) -> Result<Vec<SyncPassResult>> {
    let source: Arc<dyn ErpSource> = Arc::new(
        StaticSource::from_fixture_dir(&dir)
            .with_context(|| format!("loading fixtures from {}", dir.display()))?,
    );
    let buildings = Arc::new(MemoryBuildingStore::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());

    let mut supervisor = SyncSupervisor::new(
        estate_sync::interval_from_minutes(None),
        CancellationToken::new(),
    );
    for kind in kinds.unwrap_or_else(|| EntityKind::ALL.to_vec()) {
        let store = match kind.strategy() {
            SyncStrategy::Upsert => KindStore::Upsert(buildings.clone()),
            SyncStrategy::FullRefresh => KindStore::FullRefresh(snapshots.clone()),
        };
        supervisor = supervisor.with_worker(SyncWorker::new(kind, source.clone(), store)?);
    }
    Ok(supervisor.run_all_once().await)
}

fn print_summary(pass: &SyncPassResult) {
    match pass.fetch_error() {
        Some(error) => println!("{}: fetch failed: {error}", pass.kind),
        None => println!(
            "{}: pass_id={} outcome={:?} fetched={} created={} updated={} inserted={} skipped={}",
            pass.kind,
            pass.pass_id,
            pass.outcome,
            pass.fetched,
            pass.created,
            pass.updated,
            pass.inserted,
            pass.skipped
        ),
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tableside_service::app::api::{self, AppState};
use tableside_service::app::producer::OutboxRelay;
use tableside_service::app::sweeper;
use tableside_service::config::{ApiArgs, MigrateArgs, ProducerArgs, StoreKind, SweeperArgs};
use tableside_service::session::{SessionPolicy, SessionService};
use tableside_service::store::{MemoryStore, PgStore, Seed, Store};

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API.
    Api(ApiArgs),
    /// Relay outbox rows to Kafka.
    Producer(ProducerArgs),
    /// Expire abandoned sessions periodically.
    Sweeper(SweeperArgs),
    /// Apply pending database migrations and exit.
    Migrate(MigrateArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Api(args) => run_api(args).await,
        Commands::Producer(args) => run_producer(args).await,
        Commands::Sweeper(args) => run_sweeper(args).await,
        Commands::Migrate(args) => {
            let store = PgStore::connect(&args.database_url)?;
            migrate(&store).await
        }
    }
}

async fn migrate(store: &PgStore) -> anyhow::Result<()> {
    let store = store.clone();
    let applied = tokio::task::spawn_blocking(move || store.run_migrations())
        .await?
        .map_err(|err| anyhow!(err))
        .context("failed to run migrations")?;
    info!(?applied, "Migrations applied");
    Ok(())
}

async fn run_api(args: ApiArgs) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = match args.store {
        StoreKind::Postgres => {
            let database_url = args
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres store")?;
            let store = PgStore::connect(database_url)?;
            migrate(&store).await?;
            Arc::new(store)
        }
        StoreKind::Memory => {
            let seed = match &args.seed_file {
                Some(path) => {
                    let raw = std::fs::read_to_string(path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str::<Seed>(&raw)
                        .with_context(|| format!("invalid seed file {}", path.display()))?
                }
                None => Seed::default(),
            };
            info!(
                tables = seed.tables.len(),
                menu_items = seed.menu_items.len(),
                "Using in-memory store"
            );
            Arc::new(MemoryStore::from_seed(seed))
        }
    };

    let state = AppState::new(
        store,
        args.policy.session_policy(),
        args.policy.order_policy(),
    );
    if args.sweep_interval_seconds > 0 {
        sweeper::start_session_sweeper(
            state.sessions.clone(),
            Duration::from_secs(args.sweep_interval_seconds),
        );
    }

    api::serve(args.bind_addr, state).await
}

async fn run_producer(args: ProducerArgs) -> anyhow::Result<()> {
    let store = PgStore::connect(&args.database_url)?;
    let mut relay = OutboxRelay::connect(&args.kafka_url)?;
    tokio::task::spawn_blocking(move || relay.run(store.pool())).await?;
    Ok(())
}

async fn run_sweeper(args: SweeperArgs) -> anyhow::Result<()> {
    if args.sweep_interval_seconds == 0 {
        return Err(anyhow!("SWEEP_INTERVAL_SECONDS must be positive"));
    }
    let store = PgStore::connect(&args.database_url)?;
    let sessions = SessionService::new(Arc::new(store), SessionPolicy::default());

    sweeper::start_session_sweeper(sessions, Duration::from_secs(args.sweep_interval_seconds))
        .await?;
    Ok(())
}

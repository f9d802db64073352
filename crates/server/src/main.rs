use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arena_brain::{BrainClient, BrainConfig};
use arena_db::Db;
use arena_hub::Hub;
use arena_server::config::{BudgetConfig, Paths, RosterEntry, load_roster};
use arena_server::{AppState, build_app};

#[derive(Parser)]
#[command(name = "arena-server", about = "Agent fleet dashboard backend")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8765)]
    port: u16,

    /// Data directory holding the database, events file, and config files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory of static frontend assets to serve as the fallback.
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let paths = Paths::resolve(args.data_dir);
    info!(event = "startup", data_dir = %paths.data_dir.display());

    let roster = load_roster(&paths.metrics_path);
    if let Err(err) = prepare_store(&paths, &roster) {
        error!(event = "startup_failed", error = %err);
        std::process::exit(1);
    }

    let budget = BudgetConfig::load(&paths.budget_path);
    let brain = match BrainClient::new(BrainConfig::load(&paths.brain_config_path)) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(event = "startup_failed", error = %err);
            std::process::exit(1);
        }
    };
    let hub = Arc::new(Hub::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(arena_sync::watch_loop(
        paths.db_path.clone(),
        paths.events_path.clone(),
        hub.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(arena_brain::poll_loop(
        brain.clone(),
        hub.clone(),
        Some(paths.knowledge_db_path.clone()),
        shutdown_rx.clone(),
    ));

    let state = AppState {
        db_path: paths.db_path.clone(),
        roster: Arc::new(roster),
        budget,
        hub,
        brain,
    };
    let app = build_app(state, args.static_dir);

    let addr = format!("127.0.0.1:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("bind server");
    info!(event = "listening", addr = %addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(event = "signal_error", error = %err);
            }
            let _ = shutdown_tx.send(true);
            info!(event = "shutdown");
        })
        .await
        .expect("serve");
}

/// Opens the store, runs migrations, seeds roster levels, and replays the
/// events file so the first request sees a caught-up database.
fn prepare_store(
    paths: &Paths,
    roster: &BTreeMap<String, RosterEntry>,
) -> Result<(), arena_sync::SyncError> {
    let mut db = Db::open(&paths.db_path)?;
    db.migrate()?;
    for (agent, entry) in roster {
        db.seed_agent_level(agent, entry.invocations)?;
    }
    let (stats, _) = arena_sync::reconcile(&mut db, &paths.events_path)?;
    info!(
        event = "startup_sync",
        applied = stats.applied,
        skipped = stats.skipped
    );
    arena_sync::backfill_context_window(&mut db, &paths.events_path)?;
    Ok(())
}

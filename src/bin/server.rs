//! FieldSync Server
//!
//! Accepts batches of operations queued by field devices while offline and
//! applies them to a SQLite-backed document store.
//!
//! # Configuration
//!
//! Environment variables:
//! - `FIELDSYNC_PORT`: Port to listen on (default: 8080)
//! - `FIELDSYNC_DATABASE_PATH`: SQLite database (default: ~/.local/share/fieldsync/fieldsync.db)
//! - `FIELDSYNC_CONFIG`: Path to config file (default: ~/.config/fieldsync/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! port: 8080
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "tech-1"
//!     role: "technician"
//! sync:
//!   collections: [sites, fuelLogs, maintenanceLogs, equipment]
//!   max_operations: 500
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fieldsync::clock::SystemClock;
use fieldsync::config::Config;
use fieldsync::identity::ApiKeyStore;
use fieldsync::server::{router, AppState};
use fieldsync::store::{init_db, SqliteStore};
use fieldsync::sync::SyncService;

#[derive(Parser)]
#[command(name = "fieldsync-server")]
#[command(version)]
#[command(about = "Offline sync server for field maintenance logs", long_about = None)]
struct Args {
    /// Path to config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Port to listen on, overrides config and environment
    #[arg(long, short)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(Args::parse()).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = args.config.unwrap_or_else(Config::default_config_path);
    tracing::info!("Config file: {}", config_path.display());

    let config = Config::load(Some(config_path))?;
    let port = args.port.unwrap_or(config.port);

    tracing::info!("Database: {}", config.database_path.display());
    let pool = init_db(&config.database_path).await?;

    tracing::info!(
        "Syncable collections: {}",
        config.sync.collections.join(", ")
    );
    let sync = SyncService::new(
        Arc::new(SqliteStore::new(pool)),
        Arc::new(SystemClock),
        config.sync.clone(),
    );
    let state = AppState::new(ApiKeyStore::from_entries(&config.api_keys), sync);

    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

use axum::serve;
use dockyard::api::routes::create_router;
use dockyard::config::{AppConfig, StoreBackend};
use dockyard::external::{GithubClient, MemoryJobQueue};
use dockyard::logic::{Platform, PlatformSettings};
use dockyard::store::{MemoryStore, PostgresStore, Store};
use dockyard::{logging, seed};
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    logging::init(&config.logging);

    info!("Dockyard control plane starting");
    info!(
        "Configuration loaded: server={}:{} store={:?}",
        config.server.host, config.server.port, config.store.backend
    );

    let source_control = Arc::new(GithubClient::from_config(&config.platform)?);
    let settings = PlatformSettings::from(&config.platform);

    match config.store.backend {
        StoreBackend::Postgres => {
            info!("Connecting to PostgreSQL...");
            let database_url = config.database_url()?;
            let max_connections = config.database.max_connections.unwrap_or(20);
            let store = Arc::new(PostgresStore::new(&database_url, max_connections).await?);

            info!("Running database migrations...");
            store.migrate().await?;

            let platform = Platform::new(
                store.clone(),
                store.clone(),
                store.clone(),
                source_control,
                settings,
            );
            run_server(platform, &config).await
        }
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            let platform = Platform::new(
                store.clone(),
                store,
                Arc::new(MemoryJobQueue::new()),
                source_control,
                settings,
            );
            run_server(platform, &config).await
        }
    }
}

async fn run_server<S: Store + 'static>(
    platform: Platform<S>,
    config: &AppConfig,
) -> anyhow::Result<()> {
    // Load seed data for demonstration (optional)
    if config.seed.load {
        info!("Loading seed data...");
        seed::load_seed_data(&platform).await?;
    }

    let app = create_router::<S>()
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(platform));

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Dockyard server running on http://{}", bind_address);

    serve(listener, app).await?;

    Ok(())
}

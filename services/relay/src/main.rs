use std::env;
use std::sync::Arc;

use relay::bus::memory::InProcessBus;
use relay::bus::redis::RedisBus;
use relay::bus::RealtimeBus;
use relay::config::RelayConfig;
use relay::store::postgres::{PgCatalog, PgCommandStore};
use relay::{db, janitor, router, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = RelayConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .expect("DATABASE_URL must be set");

    info!("connecting to database...");
    let pool = db::create_pool(&database_url).await;
    db::run_migrations(&pool).await;
    info!("migrations applied");

    let bus: Arc<dyn RealtimeBus> = match config.redis_url.as_deref() {
        Some(url) => {
            info!("connecting to Redis bus...");
            Arc::new(
                RedisBus::connect(url)
                    .await
                    .expect("failed to connect to Redis"),
            )
        }
        None => {
            info!("REDIS_URL not set, running in single-instance mode");
            Arc::new(InProcessBus::new())
        }
    };

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(
        Arc::new(config),
        Arc::new(PgCatalog::new(pool.clone())),
        Arc::new(PgCommandStore::new(pool)),
        bus,
    );
    info!(instance_id = %state.instance_id, "relay instance starting");

    router::spawn_bus_listener(state.clone()).await;
    janitor::spawn(state.clone());

    let router = relay::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "relay listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("relay shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown: stop accepting, drain in-flight sessions, then exit.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

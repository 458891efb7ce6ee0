//! `roomcast-server`: loads config, prepares the room store and serves the
//! REST and WebSocket routes until SIGINT or SIGTERM.

use roomcast_db::{DbPool, DbRuntimeSettings};
use roomcast_server::config::{self, DatabaseConfig, LoggingConfig};
use roomcast_server::{app, AppState};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Where the config path came from: the first CLI argument, then
/// `ROOMCAST_CONFIG_PATH`, then `config.toml` in the working directory.
fn config_path() -> (String, &'static str) {
    let non_blank = |value: &String| !value.trim().is_empty();

    if let Some(path) = std::env::args().nth(1).filter(non_blank) {
        return (path, "cli-arg");
    }
    if let Some(path) = std::env::var("ROOMCAST_CONFIG_PATH").ok().filter(non_blank) {
        return (path, "env-var");
    }
    ("config.toml".to_string(), "default")
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn open_store(database: &DatabaseConfig) -> DbPool {
    let settings = DbRuntimeSettings {
        busy_timeout_ms: database.busy_timeout_ms,
        pool_max_size: database.pool_max_size,
    };
    let pool = roomcast_db::create_pool(&database.path, settings)
        .expect("cannot open the room store at database.path");

    let conn = pool
        .get()
        .expect("cannot check out a connection to migrate the room store");
    let applied = roomcast_db::run_migrations(&conn).expect("room store migration failed");
    drop(conn);
    tracing::info!(path = %database.path, applied, "room store ready");

    pool
}

#[tokio::main]
async fn main() {
    let (path, source) = config_path();
    let config = config::load_config(Some(path.as_str())).expect("invalid configuration");
    init_tracing(&config.logging);
    tracing::info!(%path, source, "configuration loaded");

    let pool = open_store(&config.database);
    let router = app(AppState::new(pool, config.chat.clone()));

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("cannot listen on {addr}: {e}"));
    tracing::info!(%addr, "roomcast listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stop_requested())
    .await
    .expect("server stopped with an error");

    tracing::info!("roomcast stopped");
}

/// Resolves on the first SIGINT or, on unix, SIGTERM.
async fn stop_requested() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => tracing::info!(signal = "SIGINT", "shutting down"),
        () = terminate => tracing::info!(signal = "SIGTERM", "shutting down"),
    }
}

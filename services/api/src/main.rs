use std::env;

use tracing::info;
use tracing_subscriber::EnvFilter;

use api::auth::AuthKeys;
use api::config::Config;
use api::{db, pollers, AppState};

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cfg = Config::from_env();

    info!("connecting to database...");
    let pool = db::create_pool(&cfg.database_url).await;

    let auth = AuthKeys::new(&cfg.secret_key, cfg.token_lifetime_hours);
    let state = AppState::new(pool, auth);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let poller_handles = pollers::spawn_all(&state, cfg.database_url.clone(), shutdown_rx);

    let router = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.bind_addr, "api server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Stop the pollers and let any in-flight query finish before exiting.
    let _ = shutdown_tx.send(true);
    for handle in poller_handles {
        let _ = handle.await;
    }
    info!("api server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
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

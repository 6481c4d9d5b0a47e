use std::env;
use std::pin::pin;
use std::time::Instant;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ingestor::batch::{self, BatchSettings, Buffers};
use ingestor::config::Config;
use ingestor::known_ids::KnownIds;
use ingestor::mqtt::{self, BusQueues};

// Bounded in-memory queues between the bus pump and the accept loop.
const SCAN_QUEUE_CAP: usize = 10_000;
const STATUS_QUEUE_CAP: usize = 2_000;
const EVENT_QUEUE_CAP: usize = 2_000;

// Opportunistic drain limits per accept-loop turn.
const SCAN_DRAIN: usize = 100;
const STATUS_DRAIN: usize = 50;
const EVENT_DRAIN: usize = 50;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cfg = Config::from_env();
    info!(
        batch_size = cfg.batch_max_size,
        max_age_s = cfg.batch_max_age.as_secs_f64(),
        qos = cfg.mqtt_qos,
        "starting ingestor"
    );

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .expect("failed to connect to Postgres");

    let mut known = KnownIds::load(&pool)
        .await
        .expect("failed to load known ids");

    let (scan_tx, mut scan_rx) = mpsc::channel(SCAN_QUEUE_CAP);
    let (status_tx, mut status_rx) = mpsc::channel(STATUS_QUEUE_CAP);
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_CAP);

    let (mqtt_client, pump) = mqtt::start(
        &cfg,
        BusQueues {
            scan_tx,
            status_tx,
            event_tx,
        },
    );

    let settings = BatchSettings {
        max_size: cfg.batch_max_size,
        max_age: cfg.batch_max_age,
    };
    let mut buffers = Buffers::default();
    let mut last_flush = Instant::now();
    let mut shutdown = pin!(shutdown_signal());

    loop {
        // Wait on the scan queue for whatever remains of the age budget.
        let wait = settings.max_age.saturating_sub(last_flush.elapsed());
        tokio::select! {
            () = &mut shutdown => break,
            received = timeout(wait, scan_rx.recv()) => match received {
                Ok(Some(rec)) => buffers.scans.push(rec),
                Ok(None) => {
                    error!("bus pump stopped; shutting down");
                    break;
                }
                Err(_) => {} // age budget spent
            },
        }

        for _ in 0..SCAN_DRAIN {
            match scan_rx.try_recv() {
                Ok(rec) => buffers.scans.push(rec),
                Err(_) => break,
            }
        }
        for _ in 0..STATUS_DRAIN {
            match status_rx.try_recv() {
                Ok(rec) => buffers.statuses.push(rec),
                Err(_) => break,
            }
        }
        for _ in 0..EVENT_DRAIN {
            match event_rx.try_recv() {
                Ok(rec) => buffers.events.push(rec),
                Err(_) => break,
            }
        }

        if buffers.should_flush(last_flush.elapsed(), &settings) {
            if !buffers.is_empty() {
                flush_all(&pool, &mut known, &cfg, &mut buffers).await;
            }
            last_flush = Instant::now();
        }
    }

    info!("flushing remaining buffers");
    flush_all(&pool, &mut known, &cfg, &mut buffers).await;

    let _ = mqtt_client.disconnect().await;
    pump.abort();
    pool.close().await;
    info!("ingestor shutdown complete");
}

/// Flush every non-empty buffer.  A failed batch is logged and dropped; one
/// bad batch must not take the pipeline down.
async fn flush_all(pool: &PgPool, known: &mut KnownIds, cfg: &Config, buffers: &mut Buffers) {
    if !buffers.scans.is_empty() {
        let scans = std::mem::take(&mut buffers.scans);
        if let Err(e) = batch::flush_scans(pool, known, cfg.ids_refresh, scans).await {
            error!(error = %e, "scan flush failed; batch dropped");
        }
    }
    if !buffers.statuses.is_empty() {
        let statuses = std::mem::take(&mut buffers.statuses);
        if let Err(e) = batch::flush_statuses(pool, known, cfg.ids_refresh, statuses).await {
            error!(error = %e, "status flush failed; batch dropped");
        }
    }
    if !buffers.events.is_empty() {
        let events = std::mem::take(&mut buffers.events);
        if let Err(e) = batch::flush_events(pool, known, cfg.ids_refresh, events).await {
            error!(error = %e, "event flush failed; batch dropped");
        }
    }
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

//! Change pollers: periodic queries whose fresh rows become push-channel
//! messages on the bounded update queues.
//!
//! The positions poller keeps its own dedicated connection (it is the hot
//! path and must not contend with the request pool); the slower pollers use
//! the shared pool.  A full queue drops the newest message with a warning.
//!
//! Every loop observes the shutdown signal only between queries, so an
//! in-flight query always completes before its task exits; the caller joins
//! the returned handles before the process terminates.

use std::time::Duration;

use sqlx::{Connection, PgConnection, PgPool};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::PushMessage;
use crate::rows;
use crate::state::AppState;

const POSITIONS_PERIOD: Duration = Duration::from_secs(2);
const STATS_PERIOD: Duration = Duration::from_secs(10);
const SCANS_PERIOD: Duration = Duration::from_secs(15);
const ANCHOR_STATUS_PERIOD: Duration = Duration::from_secs(15);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

pub fn spawn_all(
    state: &AppState,
    database_url: String,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let handles = vec![
        tokio::spawn(poll_positions(
            database_url,
            state.queues.positions_tx.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(poll_stats(
            state.pool.clone(),
            state.queues.stats_tx.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(poll_scans(
            state.pool.clone(),
            state.queues.scans_tx.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(poll_anchor_status(
            state.pool.clone(),
            state.queues.anchor_status_tx.clone(),
            shutdown,
        )),
    ];
    info!("change pollers started");
    handles
}

async fn poll_positions(
    database_url: String,
    tx: mpsc::Sender<PushMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(POSITIONS_PERIOD);
    let mut conn: Option<PgConnection> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        if conn.is_none() {
            match PgConnection::connect(&database_url).await {
                Ok(c) => {
                    info!("positions poll connection established");
                    conn = Some(c);
                }
                Err(e) => {
                    warn!(error = %e, "positions poll connect failed; retrying");
                    tokio::select! {
                        () = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        let Some(connection) = conn.as_mut() else {
            continue;
        };

        match rows::recent_positions(&mut *connection).await {
            Ok(positions) => {
                for row in positions {
                    if tx.try_send(PushMessage::Position(row)).is_err() {
                        warn!("positions queue full; dropping update");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "positions poll failed; reconnecting");
                conn = None;
                tokio::select! {
                    () = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
}

async fn poll_stats(
    pool: PgPool,
    tx: mpsc::Sender<PushMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(STATS_PERIOD);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        match rows::fetch_stats(&pool).await {
            Ok(stats) => {
                if tx.try_send(PushMessage::Stats(stats)).is_err() {
                    warn!("stats queue full; dropping update");
                }
            }
            Err(e) => warn!(error = %e, "stats poll failed"),
        }
    }
}

async fn poll_scans(
    pool: PgPool,
    tx: mpsc::Sender<PushMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(SCANS_PERIOD);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        match rows::latest_scans(&pool).await {
            Ok(scans) => {
                for row in scans {
                    if tx.try_send(PushMessage::Scan(row)).is_err() {
                        warn!("scans queue full; dropping update");
                    }
                }
            }
            Err(e) => warn!(error = %e, "scans poll failed"),
        }
    }
}

async fn poll_anchor_status(
    pool: PgPool,
    tx: mpsc::Sender<PushMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(ANCHOR_STATUS_PERIOD);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        match rows::latest_anchor_status(&pool).await {
            Ok(statuses) => {
                for row in statuses {
                    if tx.try_send(PushMessage::AnchorStatus(row)).is_err() {
                        warn!("anchor_status queue full; dropping update");
                    }
                }
            }
            Err(e) => warn!(error = %e, "anchor status poll failed"),
        }
    }
}

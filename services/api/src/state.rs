use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};

use crate::auth::AuthKeys;
use crate::events::PushMessage;

// Queue capacities mirror the change-poller emit rates: positions dominate.
const POSITIONS_QUEUE_CAP: usize = 1000;
const STATS_QUEUE_CAP: usize = 100;
const SCANS_QUEUE_CAP: usize = 100;
const ANCHOR_STATUS_QUEUE_CAP: usize = 100;

/// A receiver shared by every connected push client.  Whichever client task
/// locks and receives first consumes the message; the rest keep waiting.
pub type SharedRx = Arc<Mutex<mpsc::Receiver<PushMessage>>>;

#[derive(Clone)]
pub struct UpdateQueues {
    pub positions_tx: mpsc::Sender<PushMessage>,
    pub stats_tx: mpsc::Sender<PushMessage>,
    pub scans_tx: mpsc::Sender<PushMessage>,
    pub anchor_status_tx: mpsc::Sender<PushMessage>,
    pub positions_rx: SharedRx,
    pub stats_rx: SharedRx,
    pub scans_rx: SharedRx,
    pub anchor_status_rx: SharedRx,
}

#[derive(Debug, Serialize)]
pub struct QueueDepths {
    pub positions: usize,
    pub stats: usize,
    pub scans: usize,
    pub anchor_status: usize,
}

impl UpdateQueues {
    pub fn new() -> Self {
        let (positions_tx, positions_rx) = mpsc::channel(POSITIONS_QUEUE_CAP);
        let (stats_tx, stats_rx) = mpsc::channel(STATS_QUEUE_CAP);
        let (scans_tx, scans_rx) = mpsc::channel(SCANS_QUEUE_CAP);
        let (anchor_status_tx, anchor_status_rx) = mpsc::channel(ANCHOR_STATUS_QUEUE_CAP);
        Self {
            positions_tx,
            stats_tx,
            scans_tx,
            anchor_status_tx,
            positions_rx: Arc::new(Mutex::new(positions_rx)),
            stats_rx: Arc::new(Mutex::new(stats_rx)),
            scans_rx: Arc::new(Mutex::new(scans_rx)),
            anchor_status_rx: Arc::new(Mutex::new(anchor_status_rx)),
        }
    }

    /// Approximate queue depths derived from the senders, so the health
    /// endpoint never contends with a client blocked in `recv`.
    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            positions: self.positions_tx.max_capacity() - self.positions_tx.capacity(),
            stats: self.stats_tx.max_capacity() - self.stats_tx.capacity(),
            scans: self.scans_tx.max_capacity() - self.scans_tx.capacity(),
            anchor_status: self.anchor_status_tx.max_capacity()
                - self.anchor_status_tx.capacity(),
        }
    }
}

impl Default for UpdateQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queues: UpdateQueues,
    pub auth: Arc<AuthKeys>,
    pub ws_clients: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(pool: PgPool, auth: AuthKeys) -> Self {
        Self {
            pool,
            queues: UpdateQueues::new(),
            auth: Arc::new(auth),
            ws_clients: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::StatsRow;

    fn stats_msg(n: i64) -> PushMessage {
        PushMessage::Stats(StatsRow {
            active_devices: n,
            total_anchors: 0,
            total_wearables: 0,
            total_positions: 0,
            emergency_count: 0,
            ts: String::new(),
        })
    }

    #[tokio::test]
    async fn depths_track_queued_messages() {
        let queues = UpdateQueues::new();
        assert_eq!(queues.depths().stats, 0);
        queues.stats_tx.send(stats_msg(1)).await.unwrap();
        queues.stats_tx.send(stats_msg(2)).await.unwrap();
        assert_eq!(queues.depths().stats, 2);

        queues.stats_rx.lock().await.recv().await.unwrap();
        assert_eq!(queues.depths().stats, 1);
    }
}

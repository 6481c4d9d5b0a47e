use std::collections::HashSet;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tracing::{info, warn};

/// In-memory snapshot of registered anchor and wearable identifiers,
/// used to pre-filter bus traffic before the FK constraints would reject it.
///
/// Staleness is bounded: rows referencing ids created after the last load are
/// dropped until the next refresh.
#[derive(Debug)]
pub struct KnownIds {
    anchors: HashSet<String>,
    wearables: HashSet<String>,
    loaded_at: Instant,
}

impl KnownIds {
    pub fn new(anchors: HashSet<String>, wearables: HashSet<String>) -> Self {
        Self {
            anchors,
            wearables,
            loaded_at: Instant::now(),
        }
    }

    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let anchors: Vec<String> = sqlx::query_scalar("SELECT id FROM anchors")
            .fetch_all(pool)
            .await?;
        let wearables: Vec<String> = sqlx::query_scalar("SELECT uid FROM wearables")
            .fetch_all(pool)
            .await?;
        info!(
            anchors = anchors.len(),
            wearables = wearables.len(),
            "loaded known ids"
        );
        Ok(Self::new(
            anchors.into_iter().collect(),
            wearables.into_iter().collect(),
        ))
    }

    /// Reload both sets when the snapshot is at least `refresh` old.
    /// Best-effort: a failed reload keeps the previous snapshot.
    pub async fn ensure_fresh(&mut self, pool: &PgPool, refresh: Duration) {
        if self.loaded_at.elapsed() < refresh {
            return;
        }
        match Self::load(pool).await {
            Ok(fresh) => *self = fresh,
            Err(e) => warn!(error = %e, "known-id refresh failed; keeping previous snapshot"),
        }
    }

    pub fn anchor_known(&self, id: &str) -> bool {
        self.anchors.contains(id)
    }

    pub fn wearable_known(&self, uid: &str) -> bool {
        self.wearables.contains(uid)
    }
}

//! The locator tick loop.
//!
//! Single-tick-serial: one query window, one pass over the grouped scans, one
//! insert per eligible wearable.  Errors inside a tick are logged and the
//! loop cools off for a second before trying again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info};

use rtls_core::{estimate, AnchorSite, EstimatorParams, ScanSample, WriteThrottle};

use crate::config::Config;
use crate::db::{self, ScanRow};

const ERROR_COOLOFF: Duration = Duration::from_secs(1);

/// Runs until `shutdown` fires.  The signal is checked only between ticks,
/// so a tick that has already started always runs to completion before the
/// function returns.
pub async fn run(pool: &PgPool, cfg: &Config, mut shutdown: watch::Receiver<bool>) {
    info!(
        window_s = cfg.window_seconds,
        poll_s = cfg.poll_interval.as_secs_f64(),
        throttle_s = cfg.write_throttle.as_secs_f64(),
        top_k = cfg.top_k,
        "starting locator"
    );

    let params = cfg.estimator_params();
    let mut throttle = WriteThrottle::new(cfg.write_throttle);
    let mut anchors: HashMap<String, AnchorSite> = HashMap::new();
    let mut anchors_loaded_at: Option<Instant> = None;

    loop {
        match tick(
            pool,
            cfg,
            &params,
            &mut throttle,
            &mut anchors,
            &mut anchors_loaded_at,
        )
        .await
        {
            Ok(inserted) => {
                if inserted > 0 {
                    info!(inserted, "inserted positions");
                }
            }
            Err(e) => {
                error!(error = %e, "locator tick failed");
                tokio::select! {
                    () = tokio::time::sleep(ERROR_COOLOFF) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        tokio::select! {
            () = tokio::time::sleep(cfg.poll_interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("locator loop stopped");
}

async fn tick(
    pool: &PgPool,
    cfg: &Config,
    params: &EstimatorParams,
    throttle: &mut WriteThrottle,
    anchors: &mut HashMap<String, AnchorSite>,
    anchors_loaded_at: &mut Option<Instant>,
) -> Result<usize, sqlx::Error> {
    let stale = anchors_loaded_at.is_none_or(|t| t.elapsed() >= cfg.anchors_refresh);
    if stale {
        *anchors = db::fetch_anchors(pool).await?;
        *anchors_loaded_at = Some(Instant::now());
        debug!(anchors = anchors.len(), "refreshed anchor table");
    }

    let scans = db::fetch_recent_scans(pool, cfg.query_seconds()).await?;
    if scans.is_empty() {
        return Ok(0);
    }

    let by_uid = group_by_uid(scans);
    let mut inserted = 0usize;

    for (uid, samples) in &by_uid {
        if throttle.is_throttled(uid, Instant::now()) {
            continue;
        }
        let Some(est) = estimate(samples, anchors, params) else {
            continue;
        };
        db::insert_position(pool, uid, &est).await?;
        throttle.record_emit(uid, Instant::now());
        inserted += 1;
        debug!(
            uid = %uid,
            method = est.method.as_str(),
            num_anchors = est.num_anchors,
            nearest = %est.nearest_anchor_id,
            q = est.q_score,
            fix_age_s = (chrono::Utc::now() - est.latest_scan_ts).num_milliseconds() as f64 / 1000.0,
            "position estimated"
        );
    }

    Ok(inserted)
}

fn group_by_uid(scans: Vec<ScanRow>) -> HashMap<String, Vec<ScanSample>> {
    let mut by_uid: HashMap<String, Vec<ScanSample>> = HashMap::new();
    for ScanRow {
        ts,
        anchor_id,
        uid,
        rssi,
    } in scans
    {
        by_uid.entry(uid).or_default().push(ScanSample {
            ts,
            anchor_id,
            rssi,
        });
    }
    by_uid
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn grouping_partitions_rows_by_uid() {
        let now = Utc::now();
        let rows = vec![
            ScanRow {
                ts: now,
                anchor_id: "A".to_owned(),
                uid: "W-01".to_owned(),
                rssi: -60.0,
            },
            ScanRow {
                ts: now,
                anchor_id: "B".to_owned(),
                uid: "W-02".to_owned(),
                rssi: -70.0,
            },
            ScanRow {
                ts: now,
                anchor_id: "B".to_owned(),
                uid: "W-01".to_owned(),
                rssi: -65.0,
            },
        ];
        let grouped = group_by_uid(rows);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["W-01"].len(), 2);
        assert_eq!(grouped["W-02"].len(), 1);
    }
}

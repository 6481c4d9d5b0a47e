use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use rtls_core::{AnchorSite, PositionEstimate};

pub async fn fetch_anchors(pool: &PgPool) -> Result<HashMap<String, AnchorSite>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, x, y, z FROM anchors")
        .fetch_all(pool)
        .await?;
    let mut anchors = HashMap::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        anchors.insert(
            id,
            AnchorSite {
                x: row.try_get("x")?,
                y: row.try_get("y")?,
                z: row.try_get("z")?,
            },
        );
    }
    Ok(anchors)
}

#[derive(Debug, Clone)]
pub struct ScanRow {
    pub ts: DateTime<Utc>,
    pub anchor_id: String,
    pub uid: String,
    pub rssi: f64,
}

pub async fn fetch_recent_scans(pool: &PgPool, seconds: f64) -> Result<Vec<ScanRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT ts, anchor_id, uid, rssi
           FROM scans
           WHERE ts > now() - make_interval(secs => $1)
           ORDER BY ts DESC"#,
    )
    .bind(seconds)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            Ok(ScanRow {
                ts: row.try_get("ts")?,
                anchor_id: row.try_get("anchor_id")?,
                uid: row.try_get("uid")?,
                rssi: row.try_get("rssi")?,
            })
        })
        .collect()
}

/// Positions carry emit time (`ts = now()`), not observation time.
pub async fn insert_position(
    pool: &PgPool,
    uid: &str,
    est: &PositionEstimate,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO positions
             (ts, uid, x, y, z, method, q_score, zone,
              nearest_anchor_id, dist_m, num_anchors, dists)
           VALUES (now(), $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
    )
    .bind(uid)
    .bind(est.x)
    .bind(est.y)
    .bind(0.0_f64)
    .bind(est.method.as_str())
    .bind(est.q_score)
    .bind(None::<String>)
    .bind(&est.nearest_anchor_id)
    .bind(est.dist_m)
    .bind(est.num_anchors as i32)
    .bind(sqlx::types::Json(&est.dists))
    .execute(pool)
    .await?;
    Ok(())
}

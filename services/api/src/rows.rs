//! Row shapes shared by the HTTP surface and the change pollers, plus the
//! parameterized queries that produce them.
//!
//! Instants are converted to RFC-3339 strings at the edge so every consumer
//! (REST response or push message) sees the same serialization.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgExecutor, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

// ---------------------------------------------------------------------------
// Anchors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AnchorRow {
    pub id: String,
    pub name: Option<String>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct AnchorCreate {
    pub id: String,
    pub name: Option<String>,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

fn anchor_from_row(row: &PgRow) -> Result<AnchorRow, sqlx::Error> {
    Ok(AnchorRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        x: row.try_get("x")?,
        y: row.try_get("y")?,
        z: row.try_get("z")?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")?
            .to_rfc3339(),
    })
}

pub async fn list_anchors<'e>(executor: impl PgExecutor<'e>) -> Result<Vec<AnchorRow>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, name, x, y, z, created_at FROM anchors ORDER BY id")
        .fetch_all(executor)
        .await?;
    rows.iter().map(anchor_from_row).collect()
}

pub async fn insert_anchor(pool: &PgPool, anchor: &AnchorCreate) -> Result<AnchorRow, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO anchors (id, name, x, y, z) VALUES ($1, $2, $3, $4, $5)
         RETURNING id, name, x, y, z, created_at",
    )
    .bind(&anchor.id)
    .bind(&anchor.name)
    .bind(anchor.x)
    .bind(anchor.y)
    .bind(anchor.z)
    .fetch_one(pool)
    .await?;
    anchor_from_row(&row)
}

// ---------------------------------------------------------------------------
// Wearables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WearableRow {
    pub uid: String,
    pub person_ref: Option<String>,
    pub role: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct WearableCreate {
    pub uid: String,
    pub person_ref: Option<String>,
    pub role: Option<String>,
}

fn wearable_from_row(row: &PgRow) -> Result<WearableRow, sqlx::Error> {
    Ok(WearableRow {
        uid: row.try_get("uid")?,
        person_ref: row.try_get("person_ref")?,
        role: row.try_get("role")?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")?
            .to_rfc3339(),
    })
}

pub async fn list_wearables<'e>(
    executor: impl PgExecutor<'e>,
) -> Result<Vec<WearableRow>, sqlx::Error> {
    let rows = sqlx::query("SELECT uid, person_ref, role, created_at FROM wearables ORDER BY uid")
        .fetch_all(executor)
        .await?;
    rows.iter().map(wearable_from_row).collect()
}

pub async fn insert_wearable(
    pool: &PgPool,
    wearable: &WearableCreate,
) -> Result<WearableRow, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO wearables (uid, person_ref, role) VALUES ($1, $2, $3)
         RETURNING uid, person_ref, role, created_at",
    )
    .bind(&wearable.uid)
    .bind(&wearable.person_ref)
    .bind(&wearable.role)
    .fetch_one(pool)
    .await?;
    wearable_from_row(&row)
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PositionRow {
    pub id: i64,
    pub ts: String,
    pub uid: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub method: String,
    pub q_score: f64,
    pub zone: Option<String>,
    pub nearest_anchor_id: Option<String>,
    pub dist_m: Option<f64>,
    pub num_anchors: Option<i32>,
    pub dists: HashMap<String, f64>,
}

fn position_from_row(row: &PgRow) -> Result<PositionRow, sqlx::Error> {
    let dists = row
        .try_get::<Option<Json<HashMap<String, f64>>>, _>("dists")?
        .map(|j| j.0)
        .unwrap_or_default();
    Ok(PositionRow {
        id: row.try_get("id")?,
        ts: row.try_get::<DateTime<Utc>, _>("ts")?.to_rfc3339(),
        uid: row.try_get("uid")?,
        x: row.try_get("x")?,
        y: row.try_get("y")?,
        z: row.try_get("z")?,
        method: row.try_get("method")?,
        q_score: row.try_get("q_score")?,
        zone: row.try_get("zone")?,
        nearest_anchor_id: row.try_get("nearest_anchor_id")?,
        dist_m: row.try_get("dist_m")?,
        num_anchors: row.try_get("num_anchors")?,
        dists,
    })
}

/// Latest position per uid, restricted to the last 10 seconds.  This is the
/// positions poller's query.
pub async fn recent_positions<'e>(
    executor: impl PgExecutor<'e>,
) -> Result<Vec<PositionRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT DISTINCT ON (uid)
               id, ts, uid, x, y, z, method, q_score, zone,
               nearest_anchor_id, dist_m, num_anchors, dists
           FROM positions
           WHERE ts > now() - interval '10 seconds'
           ORDER BY uid, ts DESC"#,
    )
    .fetch_all(executor)
    .await?;
    rows.iter().map(position_from_row).collect()
}

/// Latest position per uid with no time restriction, for the REST surface.
pub async fn latest_positions<'e>(
    executor: impl PgExecutor<'e>,
    limit: i64,
) -> Result<Vec<PositionRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT DISTINCT ON (uid)
               id, ts, uid, x, y, z, method, q_score, zone,
               nearest_anchor_id, dist_m, num_anchors, dists
           FROM positions
           ORDER BY uid, ts DESC
           LIMIT $1"#,
    )
    .bind(limit)
    .fetch_all(executor)
    .await?;
    rows.iter().map(position_from_row).collect()
}

// ---------------------------------------------------------------------------
// Latest scan data per wearable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ScanLatestRow {
    pub uid: String,
    pub last_rssi: Option<f64>,
    pub last_battery: Option<f64>,
    pub last_temp_c: Option<f64>,
    pub last_tx_power: Option<i32>,
    pub last_emergency: Option<bool>,
    pub last_seen: Option<String>,
    /// When this snapshot was taken.
    pub ts: String,
}

pub async fn latest_scans<'e>(
    executor: impl PgExecutor<'e>,
) -> Result<Vec<ScanLatestRow>, sqlx::Error> {
    // Per-field correlated subqueries: the freshest non-null value may come
    // from different rows (not every scan carries battery or temperature).
    let rows = sqlx::query(
        r#"SELECT
               uid,
               (SELECT rssi FROM scans s2 WHERE s2.uid = s.uid AND s2.rssi IS NOT NULL ORDER BY ts DESC LIMIT 1) AS last_rssi,
               (SELECT battery FROM scans s3 WHERE s3.uid = s.uid AND s3.battery IS NOT NULL ORDER BY ts DESC LIMIT 1) AS last_battery,
               (SELECT temp_c FROM scans s4 WHERE s4.uid = s.uid AND s4.temp_c IS NOT NULL ORDER BY ts DESC LIMIT 1) AS last_temp_c,
               (SELECT tx_power_dbm FROM scans s5 WHERE s5.uid = s.uid AND s5.tx_power_dbm IS NOT NULL ORDER BY ts DESC LIMIT 1) AS last_tx_power,
               (SELECT emergency FROM scans s6 WHERE s6.uid = s.uid AND s6.emergency IS NOT NULL ORDER BY ts DESC LIMIT 1) AS last_emergency,
               MAX(s.ts) AS last_seen
           FROM scans s
           GROUP BY s.uid"#,
    )
    .fetch_all(executor)
    .await?;

    let now = Utc::now().to_rfc3339();
    rows.iter()
        .map(|row| {
            Ok(ScanLatestRow {
                uid: row.try_get("uid")?,
                last_rssi: row.try_get("last_rssi")?,
                last_battery: row.try_get("last_battery")?,
                last_temp_c: row.try_get("last_temp_c")?,
                last_tx_power: row.try_get("last_tx_power")?,
                last_emergency: row.try_get("last_emergency")?,
                last_seen: row
                    .try_get::<Option<DateTime<Utc>>, _>("last_seen")?
                    .map(|ts| ts.to_rfc3339()),
                ts: now.clone(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Latest status per anchor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AnchorStatusRow {
    pub anchor_id: String,
    pub ts: Option<String>,
    pub ip: Option<String>,
    pub fw: Option<String>,
    pub uptime_s: Option<i64>,
    pub wifi_rssi: Option<i32>,
    pub heap_free: Option<i64>,
    pub heap_min: Option<i64>,
    pub chip_temp_c: Option<f64>,
    pub tx_power_dbm: Option<i32>,
    pub ble_scan_active: Option<bool>,
    /// When this snapshot was taken.
    pub update_ts: String,
}

pub async fn latest_anchor_status<'e>(
    executor: impl PgExecutor<'e>,
) -> Result<Vec<AnchorStatusRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT DISTINCT ON (anchor_id)
               anchor_id, ts, ip, fw, uptime_s, wifi_rssi, heap_free, heap_min,
               chip_temp_c, tx_power_dbm, ble_scan_active
           FROM anchor_status
           ORDER BY anchor_id, ts DESC"#,
    )
    .fetch_all(executor)
    .await?;

    let now = Utc::now().to_rfc3339();
    rows.iter()
        .map(|row| {
            Ok(AnchorStatusRow {
                anchor_id: row.try_get("anchor_id")?,
                ts: row
                    .try_get::<Option<DateTime<Utc>>, _>("ts")?
                    .map(|ts| ts.to_rfc3339()),
                ip: row.try_get("ip")?,
                fw: row.try_get("fw")?,
                uptime_s: row.try_get("uptime_s")?,
                wifi_rssi: row.try_get("wifi_rssi")?,
                heap_free: row.try_get("heap_free")?,
                heap_min: row.try_get("heap_min")?,
                chip_temp_c: row.try_get("chip_temp_c")?,
                tx_power_dbm: row.try_get("tx_power_dbm")?,
                ble_scan_active: row.try_get("ble_scan_active")?,
                update_ts: now.clone(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Aggregate statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatsRow {
    pub active_devices: i64,
    pub total_anchors: i64,
    pub total_wearables: i64,
    pub total_positions: i64,
    pub emergency_count: i64,
    pub ts: String,
}

pub async fn fetch_stats(pool: &PgPool) -> Result<StatsRow, sqlx::Error> {
    let active_devices: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT uid) FROM positions WHERE ts > now() - INTERVAL '5 minutes'",
    )
    .fetch_one(pool)
    .await?;
    let total_anchors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM anchors")
        .fetch_one(pool)
        .await?;
    let total_wearables: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wearables")
        .fetch_one(pool)
        .await?;
    let total_positions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM positions WHERE ts > now() - INTERVAL '1 day'")
            .fetch_one(pool)
            .await?;
    let emergency_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM events WHERE type = 'emergency' AND ts > now() - INTERVAL '1 hour'",
    )
    .fetch_one(pool)
    .await?;

    Ok(StatsRow {
        active_devices,
        total_anchors,
        total_wearables,
        total_positions,
        emergency_count,
        ts: Utc::now().to_rfc3339(),
    })
}

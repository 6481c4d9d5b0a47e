//! Size/age-triggered batch persistence with FK pre-filtering.
//!
//! Three independent buffers, one per record kind.  A flush refreshes the
//! known-ID cache, drops rows whose foreign keys are unknown, and bulk-inserts
//! the rest.  If the bulk insert still trips a foreign-key violation (the
//! cache can be up to a refresh interval stale), the batch is retried
//! row-by-row so one bad row cannot sink its siblings.

use std::time::Duration;

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{info, warn};

use rtls_protocol::{EventRecord, ScanRecord, StatusRecord};

use crate::known_ids::KnownIds;

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    /// Scan buffer flush threshold; statuses and events flush at half this.
    pub max_size: usize,
    pub max_age: Duration,
}

#[derive(Debug, Default)]
pub struct Buffers {
    pub scans: Vec<ScanRecord>,
    pub statuses: Vec<StatusRecord>,
    pub events: Vec<EventRecord>,
}

impl Buffers {
    pub fn is_empty(&self) -> bool {
        self.scans.is_empty() && self.statuses.is_empty() && self.events.is_empty()
    }

    /// A flush fires when the age budget is spent or any buffer is full.
    pub fn should_flush(&self, age: Duration, settings: &BatchSettings) -> bool {
        age >= settings.max_age
            || self.scans.len() >= settings.max_size
            || self.statuses.len() >= settings.max_size / 2
            || self.events.len() >= settings.max_size / 2
    }
}

// ---------------------------------------------------------------------------
// FK pre-filters
// ---------------------------------------------------------------------------

/// Scans need both ends of the observation to be registered.
pub fn filter_scans(batch: Vec<ScanRecord>, known: &KnownIds) -> (Vec<ScanRecord>, usize) {
    let total = batch.len();
    let valid: Vec<ScanRecord> = batch
        .into_iter()
        .filter(|rec| known.anchor_known(&rec.anchor_id) && known.wearable_known(&rec.uid))
        .collect();
    let skipped = total - valid.len();
    (valid, skipped)
}

pub fn filter_statuses(batch: Vec<StatusRecord>, known: &KnownIds) -> (Vec<StatusRecord>, usize) {
    let total = batch.len();
    let valid: Vec<StatusRecord> = batch
        .into_iter()
        .filter(|rec| known.anchor_known(&rec.anchor_id))
        .collect();
    let skipped = total - valid.len();
    (valid, skipped)
}

pub fn filter_events(batch: Vec<EventRecord>, known: &KnownIds) -> (Vec<EventRecord>, usize) {
    let total = batch.len();
    let valid: Vec<EventRecord> = batch
        .into_iter()
        .filter(|rec| known.wearable_known(&rec.uid))
        .collect();
    let skipped = total - valid.len();
    (valid, skipped)
}

fn is_fk_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23503"))
}

// ---------------------------------------------------------------------------
// Scan flush
// ---------------------------------------------------------------------------

pub async fn flush_scans(
    pool: &PgPool,
    known: &mut KnownIds,
    refresh: Duration,
    batch: Vec<ScanRecord>,
) -> Result<(), sqlx::Error> {
    if batch.is_empty() {
        return Ok(());
    }
    known.ensure_fresh(pool, refresh).await;
    let (valid, skipped) = filter_scans(batch, known);
    if skipped > 0 {
        warn!(skipped, "skipping scans with unknown anchor_id/uid");
    }
    if valid.is_empty() {
        return Ok(());
    }

    match insert_scans_bulk(pool, &valid).await {
        Ok(()) => info!(inserted = valid.len(), skipped, "inserted scans"),
        Err(e) if is_fk_violation(&e) => {
            let mut inserted = 0usize;
            for rec in &valid {
                match insert_scan_row(pool, rec).await {
                    Ok(()) => inserted += 1,
                    Err(row_err) if is_fk_violation(&row_err) => {}
                    Err(row_err) => return Err(row_err),
                }
            }
            info!(
                inserted,
                total = valid.len(),
                "FK violation during scan batch; retried row-by-row"
            );
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

async fn insert_scans_bulk(pool: &PgPool, rows: &[ScanRecord]) -> Result<(), sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO scans (ts, anchor_id, uid, rssi, battery, temp_c, tx_power_dbm, adv_seq, emergency) ",
    );
    qb.push_values(rows, |mut b, rec| {
        b.push_bind(rec.ts)
            .push_bind(&rec.anchor_id)
            .push_bind(&rec.uid)
            .push_bind(rec.rssi)
            .push_bind(rec.battery)
            .push_bind(rec.temp_c)
            .push_bind(rec.tx_power_dbm)
            .push_bind(rec.adv_seq)
            .push_bind(rec.emergency);
    });
    qb.build().execute(pool).await?;
    Ok(())
}

async fn insert_scan_row(pool: &PgPool, rec: &ScanRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO scans (ts, anchor_id, uid, rssi, battery, temp_c, tx_power_dbm, adv_seq, emergency)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(rec.ts)
    .bind(&rec.anchor_id)
    .bind(&rec.uid)
    .bind(rec.rssi)
    .bind(rec.battery)
    .bind(rec.temp_c)
    .bind(rec.tx_power_dbm)
    .bind(rec.adv_seq)
    .bind(rec.emergency)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Status flush
// ---------------------------------------------------------------------------

pub async fn flush_statuses(
    pool: &PgPool,
    known: &mut KnownIds,
    refresh: Duration,
    batch: Vec<StatusRecord>,
) -> Result<(), sqlx::Error> {
    if batch.is_empty() {
        return Ok(());
    }
    known.ensure_fresh(pool, refresh).await;
    let (valid, skipped) = filter_statuses(batch, known);
    if skipped > 0 {
        warn!(skipped, "skipping statuses with unknown anchor_id");
    }
    if valid.is_empty() {
        return Ok(());
    }

    match insert_statuses_bulk(pool, &valid).await {
        Ok(()) => info!(inserted = valid.len(), skipped, "inserted anchor_status rows"),
        Err(e) if is_fk_violation(&e) => {
            let mut inserted = 0usize;
            for rec in &valid {
                match insert_status_row(pool, rec).await {
                    Ok(()) => inserted += 1,
                    Err(row_err) if is_fk_violation(&row_err) => {}
                    Err(row_err) => return Err(row_err),
                }
            }
            info!(
                inserted,
                total = valid.len(),
                "FK violation during status batch; retried row-by-row"
            );
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

async fn insert_statuses_bulk(pool: &PgPool, rows: &[StatusRecord]) -> Result<(), sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new(
        "INSERT INTO anchor_status (ts, anchor_id, ip, fw, uptime_s, wifi_rssi, heap_free, heap_min, chip_temp_c, tx_power_dbm, ble_scan_active) ",
    );
    qb.push_values(rows, |mut b, rec| {
        b.push_bind(rec.ts)
            .push_bind(&rec.anchor_id)
            .push_bind(&rec.ip)
            .push_bind(&rec.fw)
            .push_bind(rec.uptime_s)
            .push_bind(rec.wifi_rssi)
            .push_bind(rec.heap_free)
            .push_bind(rec.heap_min)
            .push_bind(rec.chip_temp_c)
            .push_bind(rec.tx_power_dbm)
            .push_bind(rec.ble_scan_active);
    });
    qb.build().execute(pool).await?;
    Ok(())
}

async fn insert_status_row(pool: &PgPool, rec: &StatusRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO anchor_status (ts, anchor_id, ip, fw, uptime_s, wifi_rssi, heap_free, heap_min, chip_temp_c, tx_power_dbm, ble_scan_active)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(rec.ts)
    .bind(&rec.anchor_id)
    .bind(&rec.ip)
    .bind(&rec.fw)
    .bind(rec.uptime_s)
    .bind(rec.wifi_rssi)
    .bind(rec.heap_free)
    .bind(rec.heap_min)
    .bind(rec.chip_temp_c)
    .bind(rec.tx_power_dbm)
    .bind(rec.ble_scan_active)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Event flush
// ---------------------------------------------------------------------------

pub async fn flush_events(
    pool: &PgPool,
    known: &mut KnownIds,
    refresh: Duration,
    batch: Vec<EventRecord>,
) -> Result<(), sqlx::Error> {
    if batch.is_empty() {
        return Ok(());
    }
    known.ensure_fresh(pool, refresh).await;
    let (valid, skipped) = filter_events(batch, known);
    if skipped > 0 {
        warn!(skipped, "skipping events with unknown uid");
    }
    if valid.is_empty() {
        return Ok(());
    }

    match insert_events_bulk(pool, &valid).await {
        Ok(()) => info!(inserted = valid.len(), skipped, "inserted events"),
        Err(e) if is_fk_violation(&e) => {
            let mut inserted = 0usize;
            for rec in &valid {
                match insert_event_row(pool, rec).await {
                    Ok(()) => inserted += 1,
                    Err(row_err) if is_fk_violation(&row_err) => {}
                    Err(row_err) => return Err(row_err),
                }
            }
            info!(
                inserted,
                total = valid.len(),
                "FK violation during event batch; retried row-by-row"
            );
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

async fn insert_events_bulk(pool: &PgPool, rows: &[EventRecord]) -> Result<(), sqlx::Error> {
    let mut qb =
        QueryBuilder::<Postgres>::new("INSERT INTO events (ts, uid, type, severity, details) ");
    qb.push_values(rows, |mut b, rec| {
        b.push_bind(rec.ts)
            .push_bind(&rec.uid)
            .push_bind(&rec.kind)
            .push_bind(rec.severity)
            .push_bind(&rec.details);
    });
    qb.build().execute(pool).await?;
    Ok(())
}

async fn insert_event_row(pool: &PgPool, rec: &EventRecord) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO events (ts, uid, type, severity, details) VALUES ($1, $2, $3, $4, $5)")
        .bind(rec.ts)
        .bind(&rec.uid)
        .bind(&rec.kind)
        .bind(rec.severity)
        .bind(&rec.details)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;

    fn known() -> KnownIds {
        KnownIds::new(
            HashSet::from(["A-01".to_owned(), "A-02".to_owned()]),
            HashSet::from(["W-01".to_owned()]),
        )
    }

    fn scan(anchor: &str, uid: &str) -> ScanRecord {
        ScanRecord {
            ts: Utc::now(),
            anchor_id: anchor.to_owned(),
            uid: uid.to_owned(),
            rssi: -60.0,
            adv_seq: None,
            battery: None,
            temp_c: None,
            tx_power_dbm: None,
            emergency: None,
        }
    }

    fn status(anchor: &str) -> StatusRecord {
        StatusRecord {
            ts: Utc::now(),
            anchor_id: anchor.to_owned(),
            ip: None,
            fw: None,
            uptime_s: None,
            wifi_rssi: None,
            heap_free: None,
            heap_min: None,
            chip_temp_c: None,
            tx_power_dbm: None,
            ble_scan_active: None,
        }
    }

    fn event(uid: &str) -> EventRecord {
        EventRecord {
            ts: Utc::now(),
            uid: uid.to_owned(),
            kind: "emergency".to_owned(),
            severity: Some(2),
            details: None,
        }
    }

    #[test]
    fn scans_require_both_anchor_and_wearable_known() {
        let batch = vec![
            scan("A-01", "W-01"),
            scan("A-01", "W-99"), // unknown wearable
            scan("Z-01", "W-01"), // unknown anchor
        ];
        let (valid, skipped) = filter_scans(batch, &known());
        assert_eq!(valid.len(), 1);
        assert_eq!(skipped, 2);
        assert_eq!(valid[0].anchor_id, "A-01");
    }

    #[test]
    fn statuses_require_only_the_anchor() {
        let batch = vec![status("A-02"), status("Z-01")];
        let (valid, skipped) = filter_statuses(batch, &known());
        assert_eq!(valid.len(), 1);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn events_require_only_the_wearable() {
        let batch = vec![event("W-01"), event("W-99")];
        let (valid, skipped) = filter_events(batch, &known());
        assert_eq!(valid.len(), 1);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn flush_fires_on_age() {
        let settings = BatchSettings {
            max_size: 200,
            max_age: Duration::from_secs(1),
        };
        let buffers = Buffers::default();
        assert!(!buffers.should_flush(Duration::from_millis(500), &settings));
        assert!(buffers.should_flush(Duration::from_secs(1), &settings));
    }

    #[test]
    fn flush_fires_on_scan_size() {
        let settings = BatchSettings {
            max_size: 4,
            max_age: Duration::from_secs(60),
        };
        let mut buffers = Buffers::default();
        for _ in 0..3 {
            buffers.scans.push(scan("A-01", "W-01"));
        }
        assert!(!buffers.should_flush(Duration::ZERO, &settings));
        buffers.scans.push(scan("A-01", "W-01"));
        assert!(buffers.should_flush(Duration::ZERO, &settings));
    }

    #[test]
    fn statuses_and_events_flush_at_half_size() {
        let settings = BatchSettings {
            max_size: 4,
            max_age: Duration::from_secs(60),
        };
        let mut buffers = Buffers::default();
        buffers.statuses.push(status("A-01"));
        assert!(!buffers.should_flush(Duration::ZERO, &settings));
        buffers.statuses.push(status("A-01"));
        assert!(buffers.should_flush(Duration::ZERO, &settings));

        let mut buffers = Buffers::default();
        buffers.events.push(event("W-01"));
        buffers.events.push(event("W-01"));
        assert!(buffers.should_flush(Duration::ZERO, &settings));
    }
}

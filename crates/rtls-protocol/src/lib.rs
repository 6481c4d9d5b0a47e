// rtls-protocol: bus payload types, decoding and timestamp normalization.
//
// Anchors publish JSON on three topic families:
//
//   rtls/anchor/<anchor_id>/scan    one RSSI observation of a wearable
//   rtls/anchor/<anchor_id>/status  anchor heartbeat
//   rtls/events                     wearable-originated events
//
// The decoder is tolerant of unknown extra fields and strict about missing
// required ones.  A record that fails to decode is dropped by the caller; the
// subscription itself is never torn down over a bad payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default lower bound for plausible wire timestamps: 2018-01-01T00:00:00Z.
pub const TS_MIN_EPOCH_MS_DEFAULT: i64 = 1_514_764_800_000;

/// Wire timestamps further than one year into the future are replaced.
const MAX_FUTURE_SKEW_MS: i64 = 365 * 24 * 3600 * 1000;

/// Identifiers (anchor ids and wearable uids) are short strings.
const MAX_ID_LEN: usize = 64;

/// Retained status topic for the ingestion service itself.
pub const INGESTOR_STATUS_TOPIC: &str = "rtls/ingestor/status";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    /// An identifier was empty or longer than 64 bytes, or a normalized
    /// timestamp could not be represented.
    #[error("invalid value for field `{field}`")]
    BadField { field: &'static str },
    #[error("ts missing and fallback disabled")]
    MissingTimestamp,
}

// ---------------------------------------------------------------------------
// Timestamp normalization
// ---------------------------------------------------------------------------

/// Policy for coercing device-reported epoch-millisecond timestamps.
#[derive(Debug, Clone, Copy)]
pub struct TsPolicy {
    /// Timestamps below this are treated as bogus (unset RTC etc.).
    pub min_epoch_ms: i64,
    /// When true, a missing `ts` falls back to the decoder's wall clock.
    pub allow_fallback_now: bool,
}

impl Default for TsPolicy {
    fn default() -> Self {
        Self {
            min_epoch_ms: TS_MIN_EPOCH_MS_DEFAULT,
            allow_fallback_now: true,
        }
    }
}

/// Coerce an optional wire timestamp into a UTC instant.
///
/// Missing `ts` falls back to `now_ms` (or errors when fallback is disabled).
/// Values below the policy minimum or more than a year ahead of `now_ms` are
/// replaced with `now_ms`; everything else is used as given.
pub fn normalize_ts(
    ts_ms: Option<i64>,
    now_ms: i64,
    policy: &TsPolicy,
) -> Result<DateTime<Utc>, DecodeError> {
    let ms = match ts_ms {
        None if policy.allow_fallback_now => now_ms,
        None => return Err(DecodeError::MissingTimestamp),
        Some(v) if v < policy.min_epoch_ms || v > now_ms + MAX_FUTURE_SKEW_MS => now_ms,
        Some(v) => v,
    };
    DateTime::from_timestamp_millis(ms).ok_or(DecodeError::BadField { field: "ts" })
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Scan payload on `rtls/anchor/<anchor_id>/scan`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanPayload {
    pub ts: Option<i64>,
    pub anchor_id: String,
    pub uid: String,
    pub rssi: f64,
    pub adv_seq: Option<i64>,
    /// Battery voltage in volts.
    pub battery: Option<f64>,
    pub temp_c: Option<f64>,
    pub tx_power_dbm: Option<i32>,
    pub emergency: Option<bool>,
}

/// Heartbeat payload on `rtls/anchor/<anchor_id>/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusPayload {
    pub ts: Option<i64>,
    pub anchor_id: String,
    pub ip: Option<String>,
    pub fw: Option<String>,
    pub uptime_s: Option<i64>,
    pub wifi_rssi: Option<i32>,
    pub heap_free: Option<i64>,
    pub heap_min: Option<i64>,
    pub chip_temp_c: Option<f64>,
    pub tx_power_dbm: Option<i32>,
    pub ble_scan_active: Option<bool>,
}

/// Event payload on `rtls/events`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    pub ts: Option<i64>,
    pub uid: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Option<i32>,
    pub details: Option<String>,
    /// Accepted on the wire but not persisted.
    pub anchor_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Decoded records
// ---------------------------------------------------------------------------

/// A scan observation with its timestamp already normalized to UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub ts: DateTime<Utc>,
    pub anchor_id: String,
    pub uid: String,
    pub rssi: f64,
    pub adv_seq: Option<i64>,
    pub battery: Option<f64>,
    pub temp_c: Option<f64>,
    pub tx_power_dbm: Option<i32>,
    pub emergency: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub ts: DateTime<Utc>,
    pub anchor_id: String,
    pub ip: Option<String>,
    pub fw: Option<String>,
    pub uptime_s: Option<i64>,
    pub wifi_rssi: Option<i32>,
    pub heap_free: Option<i64>,
    pub heap_min: Option<i64>,
    pub chip_temp_c: Option<f64>,
    pub tx_power_dbm: Option<i32>,
    pub ble_scan_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    pub uid: String,
    pub kind: String,
    pub severity: Option<i32>,
    pub details: Option<String>,
}

/// One decoded bus record, discriminated by topic family.
#[derive(Debug, Clone)]
pub enum BusRecord {
    Scan(ScanRecord),
    Status(StatusRecord),
    Event(EventRecord),
}

fn check_id(value: &str, field: &'static str) -> Result<(), DecodeError> {
    if value.is_empty() || value.len() > MAX_ID_LEN {
        return Err(DecodeError::BadField { field });
    }
    Ok(())
}

/// Decode a bus message by topic family.
///
/// Returns `Ok(None)` for topics outside the three subscribed families so the
/// caller can ignore them without logging an error.
pub fn decode(
    topic: &str,
    payload: &[u8],
    now_ms: i64,
    policy: &TsPolicy,
) -> Result<Option<BusRecord>, DecodeError> {
    if topic.starts_with("rtls/anchor/") && topic.ends_with("/scan") {
        let msg: ScanPayload = serde_json::from_slice(payload)?;
        check_id(&msg.anchor_id, "anchor_id")?;
        check_id(&msg.uid, "uid")?;
        let ts = normalize_ts(msg.ts, now_ms, policy)?;
        Ok(Some(BusRecord::Scan(ScanRecord {
            ts,
            anchor_id: msg.anchor_id,
            uid: msg.uid,
            rssi: msg.rssi,
            adv_seq: msg.adv_seq,
            battery: msg.battery,
            temp_c: msg.temp_c,
            tx_power_dbm: msg.tx_power_dbm,
            emergency: msg.emergency,
        })))
    } else if topic.starts_with("rtls/anchor/") && topic.ends_with("/status") {
        let msg: StatusPayload = serde_json::from_slice(payload)?;
        check_id(&msg.anchor_id, "anchor_id")?;
        let ts = normalize_ts(msg.ts, now_ms, policy)?;
        Ok(Some(BusRecord::Status(StatusRecord {
            ts,
            anchor_id: msg.anchor_id,
            ip: msg.ip,
            fw: msg.fw,
            uptime_s: msg.uptime_s,
            wifi_rssi: msg.wifi_rssi,
            heap_free: msg.heap_free,
            heap_min: msg.heap_min,
            chip_temp_c: msg.chip_temp_c,
            tx_power_dbm: msg.tx_power_dbm,
            ble_scan_active: msg.ble_scan_active,
        })))
    } else if topic == "rtls/events" {
        let msg: EventPayload = serde_json::from_slice(payload)?;
        check_id(&msg.uid, "uid")?;
        let ts = normalize_ts(msg.ts, now_ms, policy)?;
        Ok(Some(BusRecord::Event(EventRecord {
            ts,
            uid: msg.uid,
            kind: msg.kind,
            severity: msg.severity,
            details: msg.details,
        })))
    } else {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Ingestor presence (retained bus status)
// ---------------------------------------------------------------------------

/// Retained payload at `rtls/ingestor/status`.
///
/// The "offline" form doubles as the broker-side last will.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestorStatus {
    pub status: String,
    pub client_id: String,
}

impl IngestorStatus {
    pub fn online(client_id: &str) -> Self {
        Self {
            status: "online".to_owned(),
            client_id: client_id.to_owned(),
        }
    }

    pub fn offline(client_id: &str) -> Self {
        Self {
            status: "offline".to_owned(),
            client_id: client_id.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP API error envelope (frozen schema)
// ---------------------------------------------------------------------------

/// Error envelope used by all non-2xx HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_MS: i64 = 1_700_000_000_000; // 2023-11-14

    fn policy() -> TsPolicy {
        TsPolicy::default()
    }

    #[test]
    fn normalize_passes_plausible_ts_through() {
        let ts = normalize_ts(Some(NOW_MS - 5_000), NOW_MS, &policy()).unwrap();
        assert_eq!(ts.timestamp_millis(), NOW_MS - 5_000);
    }

    #[test]
    fn normalize_replaces_zero_ts_with_now() {
        let ts = normalize_ts(Some(0), NOW_MS, &policy()).unwrap();
        assert_eq!(ts.timestamp_millis(), NOW_MS);
    }

    #[test]
    fn normalize_replaces_far_future_ts_with_now() {
        let two_years = NOW_MS + 2 * 365 * 24 * 3600 * 1000;
        let ts = normalize_ts(Some(two_years), NOW_MS, &policy()).unwrap();
        assert_eq!(ts.timestamp_millis(), NOW_MS);
    }

    #[test]
    fn normalize_missing_ts_falls_back_to_now() {
        let ts = normalize_ts(None, NOW_MS, &policy()).unwrap();
        assert_eq!(ts.timestamp_millis(), NOW_MS);
    }

    #[test]
    fn normalize_missing_ts_errors_when_fallback_disabled() {
        let strict = TsPolicy {
            allow_fallback_now: false,
            ..TsPolicy::default()
        };
        assert!(matches!(
            normalize_ts(None, NOW_MS, &strict),
            Err(DecodeError::MissingTimestamp)
        ));
    }

    #[test]
    fn decode_scan_happy_path() {
        let payload = br#"{"ts":1700000000000,"anchor_id":"A-01","uid":"W-01","rssi":-61.5,"battery":2.97}"#;
        let rec = decode("rtls/anchor/A-01/scan", payload, NOW_MS, &policy())
            .unwrap()
            .unwrap();
        match rec {
            BusRecord::Scan(s) => {
                assert_eq!(s.anchor_id, "A-01");
                assert_eq!(s.uid, "W-01");
                assert_eq!(s.rssi, -61.5);
                assert_eq!(s.battery, Some(2.97));
                assert_eq!(s.tx_power_dbm, None);
            }
            other => panic!("expected scan, got {other:?}"),
        }
    }

    #[test]
    fn decode_scan_missing_rssi_is_rejected() {
        let payload = br#"{"anchor_id":"A-01","uid":"W-01"}"#;
        assert!(matches!(
            decode("rtls/anchor/A-01/scan", payload, NOW_MS, &policy()),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn decode_tolerates_unknown_extra_fields() {
        let payload =
            br#"{"anchor_id":"A-01","uid":"W-01","rssi":-70,"firmware_rev":"1.2.3","extra":[1]}"#;
        let rec = decode("rtls/anchor/A-01/scan", payload, NOW_MS, &policy()).unwrap();
        assert!(matches!(rec, Some(BusRecord::Scan(_))));
    }

    #[test]
    fn decode_rejects_oversized_identifier() {
        let long_id = "x".repeat(65);
        let payload = format!(r#"{{"anchor_id":"{long_id}","uid":"W-01","rssi":-70}}"#);
        assert!(matches!(
            decode("rtls/anchor/A/scan", payload.as_bytes(), NOW_MS, &policy()),
            Err(DecodeError::BadField { field: "anchor_id" })
        ));
    }

    #[test]
    fn decode_status_topic() {
        let payload = br#"{"anchor_id":"A-02","ip":"10.0.0.7","uptime_s":1234,"ble_scan_active":true}"#;
        let rec = decode("rtls/anchor/A-02/status", payload, NOW_MS, &policy())
            .unwrap()
            .unwrap();
        match rec {
            BusRecord::Status(s) => {
                assert_eq!(s.anchor_id, "A-02");
                assert_eq!(s.ip.as_deref(), Some("10.0.0.7"));
                assert_eq!(s.uptime_s, Some(1234));
                assert_eq!(s.ble_scan_active, Some(true));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn decode_event_topic() {
        let payload = br#"{"uid":"W-02","type":"emergency","severity":2,"details":"button held"}"#;
        let rec = decode("rtls/events", payload, NOW_MS, &policy())
            .unwrap()
            .unwrap();
        match rec {
            BusRecord::Event(e) => {
                assert_eq!(e.uid, "W-02");
                assert_eq!(e.kind, "emergency");
                assert_eq!(e.severity, Some(2));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn decode_ignores_unrelated_topic() {
        let rec = decode("rtls/something/else", b"{}", NOW_MS, &policy()).unwrap();
        assert!(rec.is_none());
    }

    #[test]
    fn ingestor_status_serializes_to_retained_payload() {
        let json = serde_json::to_value(IngestorStatus::online("rtls-ingestor-1")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "online", "client_id": "rtls-ingestor-1"})
        );
    }
}

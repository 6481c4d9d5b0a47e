use std::env;
use std::str::FromStr;
use std::time::Duration;

use rtls_protocol::{TsPolicy, TS_MIN_EPOCH_MS_DEFAULT};

/// Ingestor configuration, read once at startup.
///
/// Only `DATABASE_URL` is required; everything else has a default.  Values
/// that fail to parse fall back to the default rather than aborting.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_qos: u8,
    pub mqtt_client_id: String,
    pub sub_topic_scan: String,
    pub sub_topic_status: String,
    pub sub_topic_events: String,
    pub batch_max_size: usize,
    pub batch_max_age: Duration,
    pub ids_refresh: Duration,
    pub ts_policy: TsPolicy,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            mqtt_host: env_or("MQTT_BROKER_HOST", "mqtt"),
            mqtt_port: env_parse("MQTT_BROKER_PORT", 1883),
            mqtt_qos: env_parse("MQTT_QOS", 1),
            mqtt_client_id: env::var("MQTT_CLIENT_ID")
                .unwrap_or_else(|_| format!("rtls-ingestor-{}", std::process::id())),
            sub_topic_scan: env_or("SUB_TOPIC_SCAN", "rtls/anchor/+/scan"),
            sub_topic_status: env_or("SUB_TOPIC_STATUS", "rtls/anchor/+/status"),
            sub_topic_events: env_or("SUB_TOPIC_EVENTS", "rtls/events"),
            batch_max_size: env_parse("BATCH_MAX_SIZE", 200),
            batch_max_age: Duration::from_secs_f64(env_parse("BATCH_MAX_AGE_S", 1.0)),
            ids_refresh: Duration::from_secs(env_parse("IDS_REFRESH_S", 60)),
            ts_policy: TsPolicy {
                min_epoch_ms: env_parse("TS_MIN_EPOCH_MS", TS_MIN_EPOCH_MS_DEFAULT),
                allow_fallback_now: env::var("ALLOW_FALLBACK_NOW_TS")
                    .map_or(true, |v| parse_bool(&v)),
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_accepts_the_usual_truthy_forms() {
        for v in ["1", "true", "TRUE", "yes", "Yes"] {
            assert!(parse_bool(v), "{v} should parse as true");
        }
        for v in ["0", "false", "no", "", "on"] {
            assert!(!parse_bool(v), "{v} should parse as false");
        }
    }
}

use std::env;
use std::str::FromStr;
use std::time::Duration;

use rtls_core::{EstimatorParams, PathLossModel};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub window_seconds: i64,
    pub poll_interval: Duration,
    pub write_throttle: Duration,
    pub query_window_factor: f64,
    pub tx_power_dbm_at_1m: f64,
    pub path_loss_exponent: f64,
    pub weight_dist_clamp_m: f64,
    pub top_k: usize,
    /// Cadence for re-reading the anchor table; anchors added at runtime
    /// become visible within this interval.
    pub anchors_refresh: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            window_seconds: env_parse("WINDOW_SECONDS", 7),
            poll_interval: Duration::from_secs_f64(env_parse("POLL_INTERVAL", 1.5)),
            write_throttle: Duration::from_secs_f64(env_parse("WRITE_THROTTLE_S", 5.0)),
            query_window_factor: env_parse("QUERY_WINDOW_FACTOR", 2.0),
            tx_power_dbm_at_1m: env_parse("TX_POWER_DBM_AT_1M", -59.0),
            path_loss_exponent: env_parse("PATH_LOSS_EXPONENT", 2.2),
            weight_dist_clamp_m: env_parse("WEIGHT_DIST_CLAMP_M", 0.5),
            top_k: env_parse("TOP_K", 3),
            anchors_refresh: Duration::from_secs(env_parse("IDS_REFRESH_S", 60)),
        }
    }

    pub fn estimator_params(&self) -> EstimatorParams {
        EstimatorParams {
            window: chrono::Duration::seconds(self.window_seconds),
            top_k: self.top_k,
            weight_dist_clamp_m: self.weight_dist_clamp_m,
            model: PathLossModel {
                tx_power_dbm_at_1m: self.tx_power_dbm_at_1m,
                path_loss_exponent: self.path_loss_exponent,
            },
        }
    }

    /// The DB query spans a wider window than the per-device one so that the
    /// per-uid alignment has material to work with.
    pub fn query_seconds(&self) -> f64 {
        let window = self.window_seconds as f64;
        (window * self.query_window_factor).max(window)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            database_url: "postgres://localhost/test".to_owned(),
            window_seconds: 7,
            poll_interval: Duration::from_secs_f64(1.5),
            write_throttle: Duration::from_secs(5),
            query_window_factor: 2.0,
            tx_power_dbm_at_1m: -59.0,
            path_loss_exponent: 2.2,
            weight_dist_clamp_m: 0.5,
            top_k: 3,
            anchors_refresh: Duration::from_secs(60),
        }
    }

    #[test]
    fn query_window_is_factor_times_device_window() {
        assert_eq!(base().query_seconds(), 14.0);
    }

    #[test]
    fn query_window_never_shrinks_below_device_window() {
        let cfg = Config {
            query_window_factor: 0.5,
            ..base()
        };
        assert_eq!(cfg.query_seconds(), 7.0);
    }
}

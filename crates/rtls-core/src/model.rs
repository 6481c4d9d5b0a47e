/// Log-distance path-loss model mapping RSSI to a range estimate.
///
/// `d = 10 ^ ((tx_power_at_1m − rssi) / (10 · n))`, in meters.  The result is
/// not clamped here; the estimator clamps distances before weighting.
#[derive(Debug, Clone, Copy)]
pub struct PathLossModel {
    /// Expected RSSI at 1 m, dBm.
    pub tx_power_dbm_at_1m: f64,
    /// Path-loss exponent `n` (2.0 free space, higher indoors).
    pub path_loss_exponent: f64,
}

impl Default for PathLossModel {
    fn default() -> Self {
        Self {
            tx_power_dbm_at_1m: -59.0,
            path_loss_exponent: 2.2,
        }
    }
}

impl PathLossModel {
    pub fn distance_m(&self, rssi: f64) -> f64 {
        10f64.powf((self.tx_power_dbm_at_1m - rssi) / (10.0 * self.path_loss_exponent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rssi_at_reference_power_is_one_meter() {
        for n in [1.0, 2.0, 2.2, 4.0] {
            let model = PathLossModel {
                tx_power_dbm_at_1m: -59.0,
                path_loss_exponent: n,
            };
            assert!((model.distance_m(-59.0) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn weaker_rssi_means_larger_distance() {
        let model = PathLossModel::default();
        assert!(model.distance_m(-80.0) > model.distance_m(-60.0));
    }
}

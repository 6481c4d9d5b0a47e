//! RSSI-based position estimation over a per-device time window.
//!
//! The caller groups recent scan rows by wearable uid and hands each group to
//! [`estimate`].  The window is aligned to the device's own latest scan, not
//! to the wall clock, so a device whose reports arrive in bursts still gets a
//! coherent set of anchors.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::model::PathLossModel;

/// Fixed receiver position in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorSite {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One scan row for a single wearable.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSample {
    pub ts: DateTime<Utc>,
    pub anchor_id: String,
    pub rssi: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct EstimatorParams {
    /// Per-device window; scans older than `latest − window` are discarded.
    pub window: Duration,
    /// How many of the strongest anchors feed the centroid.
    pub top_k: usize,
    /// Distances below this are clamped before weighting, bounding `1/d²`.
    pub weight_dist_clamp_m: f64,
    pub model: PathLossModel,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            window: Duration::seconds(7),
            top_k: 3,
            weight_dist_clamp_m: 0.5,
            model: PathLossModel::default(),
        }
    }
}

/// Which rule produced a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Inverse-distance-squared weighted centroid over the top-K anchors.
    Proximity,
    /// Degenerate weights; pinned to the nearest anchor.
    FallbackNearest,
    /// Only one anchor heard; pinned to that anchor.
    SingleAnchor,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Proximity => "proximity",
            Method::FallbackNearest => "fallback_nearest",
            Method::SingleAnchor => "single_anchor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionEstimate {
    pub x: f64,
    pub y: f64,
    pub method: Method,
    /// Heuristic confidence in [0, 1].
    pub q_score: f64,
    pub nearest_anchor_id: String,
    /// Estimated meters to the nearest anchor.
    pub dist_m: f64,
    pub num_anchors: usize,
    /// Estimated distance per retained anchor (not just the top-K).
    pub dists: BTreeMap<String, f64>,
    /// Timestamp of the freshest scan that went into the estimate.
    pub latest_scan_ts: DateTime<Utc>,
}

struct AnchorAggregate {
    best_rssi: f64,
    latest_ts: DateTime<Utc>,
}

/// Estimate a planar position for one wearable from its recent scans.
///
/// Returns `None` when the window is empty or every scan refers to an anchor
/// missing from `anchors`.
pub fn estimate(
    samples: &[ScanSample],
    anchors: &HashMap<String, AnchorSite>,
    params: &EstimatorParams,
) -> Option<PositionEstimate> {
    let uid_latest = samples.iter().map(|s| s.ts).max()?;
    let window_start = uid_latest - params.window;

    // Best RSSI and freshest timestamp per anchor inside the aligned window.
    let mut per_anchor: BTreeMap<&str, AnchorAggregate> = BTreeMap::new();
    for sample in samples.iter().filter(|s| s.ts >= window_start) {
        if !anchors.contains_key(&sample.anchor_id) {
            continue;
        }
        per_anchor
            .entry(sample.anchor_id.as_str())
            .and_modify(|agg| {
                if sample.rssi > agg.best_rssi {
                    agg.best_rssi = sample.rssi;
                }
                if sample.ts > agg.latest_ts {
                    agg.latest_ts = sample.ts;
                }
            })
            .or_insert(AnchorAggregate {
                best_rssi: sample.rssi,
                latest_ts: sample.ts,
            });
    }
    if per_anchor.is_empty() {
        return None;
    }

    let num_anchors = per_anchor.len();

    let dists: BTreeMap<String, f64> = per_anchor
        .iter()
        .map(|(aid, agg)| ((*aid).to_owned(), params.model.distance_m(agg.best_rssi)))
        .collect();

    // Strict comparison keeps the lexicographically first anchor on RSSI ties,
    // so the result is deterministic for fixed inputs.
    let mut nearest: (&str, f64) = per_anchor
        .iter()
        .next()
        .map(|(aid, agg)| (*aid, agg.best_rssi))?;
    for (aid, agg) in &per_anchor {
        if agg.best_rssi > nearest.1 {
            nearest = (*aid, agg.best_rssi);
        }
    }
    let nearest_anchor_id = nearest.0.to_owned();
    let dist_m = dists.get(&nearest_anchor_id).copied()?;
    let nearest_site = anchors.get(&nearest_anchor_id)?;

    let (x, y, method) = if num_anchors == 1 {
        (nearest_site.x, nearest_site.y, Method::SingleAnchor)
    } else {
        let mut ranked: Vec<(&str, f64)> = per_anchor
            .iter()
            .map(|(aid, agg)| (*aid, agg.best_rssi))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked.truncate(params.top_k);

        let mut wsum_x = 0.0;
        let mut wsum_y = 0.0;
        let mut wtot = 0.0;
        for (aid, rssi) in &ranked {
            let site = anchors.get(*aid)?;
            let d = params.model.distance_m(*rssi).max(params.weight_dist_clamp_m);
            let w = 1.0 / (d * d);
            wsum_x += w * site.x;
            wsum_y += w * site.y;
            wtot += w;
        }
        if wtot > 0.0 {
            (wsum_x / wtot, wsum_y / wtot, Method::Proximity)
        } else {
            (nearest_site.x, nearest_site.y, Method::FallbackNearest)
        }
    };

    let q_score = quality_score(&per_anchor, num_anchors, params.top_k);
    let latest_scan_ts = per_anchor
        .values()
        .map(|agg| agg.latest_ts)
        .max()
        .unwrap_or(uid_latest);

    Some(PositionEstimate {
        x,
        y,
        method,
        q_score,
        nearest_anchor_id,
        dist_m,
        num_anchors,
        dists,
        latest_scan_ts,
    })
}

/// Blend of anchor count (60 %) and RSSI spread (40 %), clamped to [0, 1].
fn quality_score(
    per_anchor: &BTreeMap<&str, AnchorAggregate>,
    num_anchors: usize,
    top_k: usize,
) -> f64 {
    let spread = if num_anchors > 1 {
        let max = per_anchor
            .values()
            .map(|a| a.best_rssi)
            .fold(f64::NEG_INFINITY, f64::max);
        let min = per_anchor
            .values()
            .map(|a| a.best_rssi)
            .fold(f64::INFINITY, f64::min);
        max - min
    } else {
        0.0
    };
    let anchor_factor = if num_anchors > 1 {
        let denom = top_k.saturating_sub(1).max(1) as f64;
        ((num_anchors - 1) as f64 / denom).min(1.0)
    } else {
        0.0
    };
    let spread_factor = 1.0 - (spread.abs() / 40.0).min(1.0);
    (0.6 * anchor_factor + 0.4 * spread_factor).clamp(0.0, 1.0)
}

//! Pure positioning domain for the RTLS pipeline.
//!
//! Nothing in this crate touches the store or the bus: the locator service
//! feeds scan rows in and writes the resulting estimates out.

pub mod estimator;
pub mod model;
pub mod throttle;

pub use estimator::{estimate, AnchorSite, EstimatorParams, Method, PositionEstimate, ScanSample};
pub use model::PathLossModel;
pub use throttle::WriteThrottle;

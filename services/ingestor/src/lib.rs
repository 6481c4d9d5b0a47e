//! MQTT ingestion service.
//!
//! Subscribes to the anchor scan/status topics and the event topic, decodes
//! and normalizes payloads, pre-filters rows against the known-ID cache, and
//! batch-inserts into PostgreSQL with size/age flush thresholds.

pub mod batch;
pub mod config;
pub mod known_ids;
pub mod mqtt;

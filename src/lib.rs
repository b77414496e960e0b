//! perptrack backend library.
//!
//! Exposes the full pipeline to the binary and the integration tests:
//! venue adapters feed per-venue trackers, trackers batch into the WRITE
//! store, periodic jobs roll ticks up and materialize them into the READ
//! store, and the API layer serves the READ side.

pub mod adapters;
pub mod aggregation;
pub mod analytics;
pub mod api;
pub mod config;
pub mod materialize;
pub mod models;
pub mod normalize;
pub mod scheduler;
pub mod storage;
pub mod tracker;

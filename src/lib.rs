// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod agent;
pub mod api;
pub mod classify;
pub mod config;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod judge;
pub mod metrics;
pub mod model;
pub mod optimize;
pub mod pipeline;
pub mod prefilter;
pub mod reputation;
pub mod scoring;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::pipeline::{BatchReport, CancelFlag, Pipeline, Services};

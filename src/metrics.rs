// src/metrics.rs
//! Prometheus recorder and `/metrics` route.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

impl Metrics {
    /// Install the global recorder on first call; later calls share it.
    pub fn init() -> Result<Self> {
        let handle = HANDLE
            .get_or_try_init(|| {
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("prometheus: install recorder")
            })?
            .clone();
        ensure_described();
        Ok(Self { handle })
    }

    /// `/metrics` in the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time metric descriptions (so series show up on /metrics).
pub(crate) fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("triage_ingested_total", "Raw documents received by the normalizer.");
        describe_counter!("triage_malformed_total", "Raw documents rejected as malformed.");
        describe_counter!("triage_duplicates_total", "Articles marked duplicate-of a canonical.");
        describe_counter!(
            "triage_prefilter_rejected_total",
            "Canonical articles soft-deleted by the pre-filter."
        );
        describe_counter!(
            "triage_classification_fallback_total",
            "Classifications that fell back to unclassified after the retry."
        );
        describe_counter!(
            "triage_model_skipped_total",
            "Model judgment calls skipped because both cheap signals were below the bar."
        );
        describe_counter!(
            "triage_external_timeouts_total",
            "Judgment/embedding calls that exceeded their deadline."
        );
        describe_counter!("triage_tier_total", "Assessments per tier.");
        describe_histogram!("triage_batch_duration_ms", "Batch wall time in milliseconds.");
        describe_gauge!("triage_last_batch_ts", "Unix time of the last scheduled batch tick.");
        describe_counter!("agent_queries_total", "Query agent responses by status.");
        describe_counter!("optimize_promotions_total", "Recompiled configurations promoted.");
    });
}

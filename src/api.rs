// src/api.rs
//! HTTP surface: ingest batches, daily shortlist, question answering, plus
//! admin routes for the labeling loop and pre-filter audit.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::agent::{AskFilters, AskResponse, QueryAgent};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::ingest::RawDocument;
use crate::metrics::Metrics;
use crate::model::{Classification, Region, ShortlistEntry, Tier, Topic};
use crate::optimize::{self, LabelCandidate, OptimizationLoop, OptimizeOutcome};
use crate::pipeline::{BatchReport, CancelFlag, Pipeline, Services};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub agent: Arc<QueryAgent>,
    pub optimizer: Arc<OptimizationLoop>,
}

impl AppState {
    /// Wire the pipeline, query agent and optimization loop around one store.
    pub fn new(cfg: PipelineConfig, store: Arc<Store>, services: Services) -> Self {
        let agent = QueryAgent::new(
            store.clone(),
            services.rules.clone(),
            services.embedder.clone(),
            services.judge.clone(),
            services.gate.clone(),
            cfg.agent.clone(),
        );
        let optimize_cfg = cfg.optimize.clone();
        let rules = services.rules.clone();
        let embedder = services.embedder.clone();
        let gate = services.gate.clone();
        let pipeline = Pipeline::new(cfg, store, services);
        let optimizer = OptimizationLoop::new(optimize_cfg, rules, embedder, gate, pipeline.live_params().clone());
        Self {
            pipeline: Arc::new(pipeline),
            agent: Arc::new(agent),
            optimizer: Arc::new(optimizer),
        }
    }
}

pub fn router(state: AppState, metrics: Option<&Metrics>) -> Router {
    let mut r = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ingest", post(ingest))
        .route("/shortlist", get(shortlist))
        .route("/ask", post(ask))
        .route("/admin/review", get(review_candidates))
        .route("/admin/labels", post(record_labels))
        .route("/admin/optimize", post(run_optimize))
        .route("/debug/rejected", get(debug_rejected));
    if let Some(m) = metrics {
        r = r.merge(m.router());
    }
    r.layer(CorsLayer::very_permissive()).with_state(state)
}

/// JSON error body with a status code.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        tracing::error!(target: "pipeline", error = %e, "batch aborted");
        ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IngestReq {
    Bare(Vec<RawDocument>),
    Wrapped { documents: Vec<RawDocument> },
}

async fn ingest(State(state): State<AppState>, Json(body): Json<IngestReq>) -> Result<Json<BatchReport>, ApiError> {
    let docs = match body {
        IngestReq::Bare(d) | IngestReq::Wrapped { documents: d } => d,
    };
    let report = state.pipeline.run_batch(&docs, &CancelFlag::new()).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ShortlistParams {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

/// Shortlist for `[from, to)`; defaults to the last 24 hours.
async fn shortlist(State(state): State<AppState>, Query(q): Query<ShortlistParams>) -> Json<Vec<ShortlistEntry>> {
    let now = Utc::now();
    let to = q.to.unwrap_or(now + Duration::seconds(1));
    let from = q.from.unwrap_or(to - Duration::days(1));
    Json(state.pipeline.store().shortlist(from, to))
}

#[derive(Deserialize)]
struct AskReq {
    question: String,
    #[serde(default)]
    filters: Option<AskFilters>,
}

async fn ask(State(state): State<AppState>, Json(req): Json<AskReq>) -> Json<AskResponse> {
    Json(state.agent.ask(&req.question, req.filters.as_ref()).await)
}

async fn review_candidates(State(state): State<AppState>) -> Result<Json<Vec<LabelCandidate>>, ApiError> {
    Ok(Json(state.optimizer.select(state.pipeline.store()).await?))
}

#[derive(Deserialize)]
struct LabelReq {
    article_id: String,
    region: Region,
    topics: BTreeSet<Topic>,
    relevance: Tier,
    #[serde(default)]
    rationale: String,
}

#[derive(Serialize)]
struct LabelResp {
    recorded: usize,
    unknown_ids: Vec<String>,
}

async fn record_labels(State(state): State<AppState>, Json(labels): Json<Vec<LabelReq>>) -> Result<Json<LabelResp>, ApiError> {
    let now = Utc::now();
    let store = state.pipeline.store();
    let mut examples = Vec::with_capacity(labels.len());
    let mut unknown_ids = Vec::new();
    for l in labels {
        let Some(stored) = store.get(&l.article_id) else {
            unknown_ids.push(l.article_id);
            continue;
        };
        let truth = Classification::new(l.region, l.topics, 1.0, l.rationale)
            .map_err(|e| ApiError(StatusCode::UNPROCESSABLE_ENTITY, format!("{}: {e}", l.article_id)))?;
        let reputation = store.source_reputation(&stored.article.source);
        examples.push(optimize::label(&stored, reputation.as_ref(), truth, l.relevance, now));
    }
    let recorded = state.optimizer.record(&examples)?;
    Ok(Json(LabelResp { recorded, unknown_ids }))
}

async fn run_optimize(State(state): State<AppState>) -> Result<Json<OptimizeOutcome>, ApiError> {
    let opt = state.optimizer.clone();
    let outcome = tokio::task::spawn_blocking(move || opt.run_once())
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(outcome))
}

#[derive(Serialize)]
struct RejectedOut {
    article_id: String,
    title: String,
    source: String,
    confidence: f32,
    reasons: Vec<String>,
    rejected_at: DateTime<Utc>,
}

/// Soft-deleted pre-filter rejects, newest first.
async fn debug_rejected(State(state): State<AppState>) -> Json<Vec<RejectedOut>> {
    let mut rows: Vec<RejectedOut> = state
        .pipeline
        .store()
        .rejected()
        .into_iter()
        .filter_map(|s| {
            let r = s.rejection?;
            Some(RejectedOut {
                article_id: s.article.id,
                title: s.article.title,
                source: s.article.source,
                confidence: r.confidence,
                reasons: r.reasons,
                rejected_at: r.rejected_at,
            })
        })
        .collect();
    rows.sort_by(|a, b| b.rejected_at.cmp(&a.rejected_at).then_with(|| a.article_id.cmp(&b.article_id)));
    Json(rows)
}

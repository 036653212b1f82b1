//! Article triage service: binary entrypoint.
//! Loads configuration, wires the pipeline stages and serves the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use article_triage::api::{router, AppState};
use article_triage::classify::TaxonomyRules;
use article_triage::config::{ModelConfig, PipelineConfig};
use article_triage::ingest::config::{load_priority_default, SourcePriority};
use article_triage::ingest::scheduler::{spawn_batch_scheduler, BatchSchedulerCfg, SpoolCollector};
use article_triage::ingest::DocumentCollector;
use article_triage::judge::embed::build_embedder;
use article_triage::judge::{build_judge, ServiceGate};
use article_triage::metrics::Metrics;
use article_triage::optimize::DeployedPointer;
use article_triage::pipeline::Services;
use article_triage::prefilter::{start_hot_reload_thread, PrefilterEngine, PrefilterHandle};
use article_triage::store::Store;

const ENV_BIND: &str = "TRIAGE_BIND";
const ENV_SPOOL_DIR: &str = "TRIAGE_SPOOL_DIR";
const ENV_BATCH_INTERVAL_SECS: &str = "TRIAGE_BATCH_INTERVAL_SECS";
const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// Compact logs by default; `LOG_FORMAT=json` for structured output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("article_triage=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

fn batch_interval() -> Duration {
    let secs = std::env::var(ENV_BATCH_INTERVAL_SECS)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(3600);
    Duration::from_secs(secs)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let mut cfg = PipelineConfig::load().context("loading pipeline config")?;
    if let Some(pointer) = DeployedPointer::load(&cfg.optimize.pointer_path)? {
        info!(target: "optimize", version = pointer.version, score = pointer.validation_score, "applying deployed parameters");
        pointer.params.apply_to(&mut cfg);
    }
    let model = ModelConfig::load().context("loading model config")?;

    let rules = match &cfg.classifier.rules_path {
        Some(p) => TaxonomyRules::from_path(p)?,
        None => TaxonomyRules::builtin()?,
    };

    let prefilter = PrefilterHandle::new(PrefilterEngine::load(&cfg.prefilter)?);
    if let Some(path) = PrefilterEngine::rules_path(&cfg.prefilter) {
        start_hot_reload_thread(prefilter.clone(), path);
    }

    let timeout = cfg.runtime.external_timeout();
    let priority = load_priority_default().unwrap_or_else(|e| {
        warn!(target: "config", error = %e, "source priority not loaded, ties fall back to arrival order");
        SourcePriority::default()
    });
    let services = Services {
        rules: Arc::new(rules),
        prefilter,
        embedder: build_embedder(&model, timeout),
        judge: build_judge(&model, timeout),
        gate: ServiceGate::new(cfg.runtime.concurrency, timeout),
        priority,
    };

    let store = Arc::new(Store::open(&cfg.store).context("opening article store")?);
    info!(target: "store", articles = store.len(), "store opened");

    let metrics = Metrics::init()?;
    let state = AppState::new(cfg, store, services);

    if let Ok(dir) = std::env::var(ENV_SPOOL_DIR) {
        let collectors: Vec<Box<dyn DocumentCollector>> = vec![Box::new(SpoolCollector::new(PathBuf::from(dir)))];
        spawn_batch_scheduler(
            BatchSchedulerCfg {
                interval: batch_interval(),
            },
            state.pipeline.clone(),
            collectors,
        );
    }

    let app = router(state, Some(&metrics));
    let bind = std::env::var(ENV_BIND).unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(target: "pipeline", %bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

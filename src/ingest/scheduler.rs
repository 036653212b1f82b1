// src/ingest/scheduler.rs
//! Periodic batch runs: pull from every collector, run one pipeline batch,
//! then sweep old articles into the cold partition.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use metrics::gauge;
use tokio::task::JoinHandle;

use crate::ingest::{collect_once, DocumentCollector, RawDocument};
use crate::pipeline::{CancelFlag, Pipeline};

#[derive(Clone, Copy, Debug)]
pub struct BatchSchedulerCfg {
    pub interval: Duration,
}

/// Collector reading `*.json` files (each an array of raw documents) from a
/// drop directory. Consumed files are renamed to `*.json.done`.
pub struct SpoolCollector {
    dir: PathBuf,
}

impl SpoolCollector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn pending(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir).with_context(|| format!("reading spool {}", self.dir.display()))? {
            let p = entry?.path();
            if p.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(p);
            }
        }
        out.sort();
        Ok(out)
    }
}

fn read_spool_file(p: &Path) -> Result<Vec<RawDocument>> {
    let s = std::fs::read_to_string(p)?;
    Ok(serde_json::from_str(&s).with_context(|| format!("parsing {}", p.display()))?)
}

#[async_trait]
impl DocumentCollector for SpoolCollector {
    async fn fetch_batch(&self) -> Result<Vec<RawDocument>> {
        let mut docs = Vec::new();
        for p in self.pending()? {
            match read_spool_file(&p) {
                Ok(mut v) => docs.append(&mut v),
                Err(e) => tracing::warn!(target: "ingest", file = %p.display(), error = ?e, "bad spool file"),
            }
            std::fs::rename(&p, p.with_extension("json.done"))?;
        }
        Ok(docs)
    }

    fn name(&self) -> &'static str {
        "spool"
    }
}

/// Run one tick: collect, process, archive. Returns the number of raw documents seen.
pub async fn run_tick(pipeline: &Pipeline, collectors: &[Box<dyn DocumentCollector>]) -> usize {
    let raws = collect_once(collectors).await;
    let n = raws.len();
    if n > 0 {
        if let Err(e) = pipeline.run_batch(&raws, &CancelFlag::new()).await {
            tracing::error!(target: "pipeline", error = %e, "scheduled batch aborted");
        }
    }
    if let Err(e) = pipeline.store().archive(Utc::now()) {
        tracing::warn!(target: "store", error = %e, "retention sweep failed");
    }
    gauge!("triage_last_batch_ts").set(Utc::now().timestamp() as f64);
    n
}

pub fn spawn_batch_scheduler(
    cfg: BatchSchedulerCfg,
    pipeline: Arc<Pipeline>,
    collectors: Vec<Box<dyn DocumentCollector>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        loop {
            ticker.tick().await;
            let n = run_tick(&pipeline, &collectors).await;
            tracing::info!(target: "ingest", raw = n, "scheduled batch tick");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spool_files_are_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let doc = RawDocument {
            title: Some("t".into()),
            body: Some("b".into()),
            url: Some("https://x.test".into()),
            ..RawDocument::default()
        };
        std::fs::write(dir.path().join("a.json"), serde_json::to_string(&vec![doc.clone()]).unwrap()).unwrap();
        std::fs::write(dir.path().join("bad.json"), "nope").unwrap();
        let c = SpoolCollector::new(dir.path());
        assert_eq!(c.fetch_batch().await.unwrap(), vec![doc]);
        assert!(c.fetch_batch().await.unwrap().is_empty());
        assert!(dir.path().join("a.json.done").exists());
    }
}

// src/optimize/mod.rs
//! Out-of-band optimization loop: pick articles worth labeling, accumulate
//! labeled examples, and recompile the classifier/scorer parameters.
//!
//! A recompiled version is promoted only when it strictly beats the deployed
//! version on the same validation split. Otherwise the deployed version stays
//! and the attempt is logged. A promotion is written to the pointer file and
//! swapped into the [`LiveParams`] the running pipeline reads.

pub mod compile;
pub mod selection;
pub mod training;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::TaxonomyRules;
use crate::config::OptimizeConfig;
use crate::judge::embed::DynEmbedder;
use crate::judge::ServiceGate;
use crate::model::TrainingExample;
use crate::store::Store;
pub use compile::{compile, evaluate, CompiledParams, LiveParams, ValidationMetrics};
pub use selection::LabelCandidate;
pub use training::{label, split, DeployedPointer, Split, TrainingLog};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OptimizeOutcome {
    /// Not enough new examples since the last compile.
    Waiting { pending: usize, needed: usize },
    Promoted {
        version: u32,
        validation_score: f32,
        previous_score: f32,
    },
    Retained {
        version: u32,
        candidate_score: f32,
        deployed_score: f32,
    },
}

pub struct OptimizationLoop {
    cfg: OptimizeConfig,
    log: TrainingLog,
    rules: Arc<TaxonomyRules>,
    embedder: DynEmbedder,
    gate: ServiceGate,
    /// Shared with the classifier and scorer.
    live: LiveParams,
    /// Parameters in effect when no pointer has been written yet.
    base: CompiledParams,
    /// Labeled-set vectors by article id; labels are append-only.
    vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl OptimizationLoop {
    pub fn new(
        cfg: OptimizeConfig,
        rules: Arc<TaxonomyRules>,
        embedder: DynEmbedder,
        gate: ServiceGate,
        live: LiveParams,
    ) -> Self {
        let log = TrainingLog::new(cfg.log_path.clone());
        let base = live.get();
        Self {
            cfg,
            log,
            rules,
            embedder,
            gate,
            live,
            base,
            vectors: Mutex::new(HashMap::new()),
        }
    }

    pub fn deployed(&self) -> Result<Option<DeployedPointer>> {
        DeployedPointer::load(&self.cfg.pointer_path)
    }

    /// Parameters currently in effect.
    pub fn current_params(&self) -> Result<CompiledParams> {
        Ok(self.deployed()?.map(|p| p.params).unwrap_or_else(|| self.base.clone()))
    }

    pub fn record(&self, examples: &[TrainingExample]) -> Result<usize> {
        let n = self.log.append(examples)?;
        debug!(target: "optimize", appended = n, "training examples recorded");
        Ok(n)
    }

    /// Review-queue and low-confidence articles, most informative first.
    pub async fn select(&self, store: &Store) -> Result<Vec<LabelCandidate>> {
        let examples = self.log.load()?;
        let labeled_ids: HashSet<String> = examples.iter().map(|e| e.article.id.clone()).collect();
        let labeled_vectors = self.labeled_vectors(&examples).await;
        let params = self.current_params()?;
        let picked = selection::prioritize(
            store.review_candidates(self.cfg.low_confidence),
            &labeled_ids,
            &labeled_vectors,
            &store.reputation(),
            &params.scoring,
            &self.cfg,
        );
        info!(target: "optimize", candidates = picked.len(), labeled = labeled_ids.len(), "labeling candidates selected");
        Ok(picked)
    }

    /// Vectors for the labeled set. Only examples not embedded before go
    /// through the gate; on failure the cached subset is used.
    async fn labeled_vectors(&self, examples: &[TrainingExample]) -> Vec<Vec<f32>> {
        let missing: Vec<(String, String)> = {
            let cache = self.vectors.lock();
            let mut seen = HashSet::new();
            examples
                .iter()
                .filter(|e| !cache.contains_key(&e.article.id) && seen.insert(e.article.id.clone()))
                .map(|e| (e.article.id.clone(), e.article.embedding_text()))
                .collect()
        };
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            match self.gate.run("embeddings", self.embedder.embed(&texts)).await {
                Ok(v) => {
                    let mut cache = self.vectors.lock();
                    for ((id, _), vector) in missing.into_iter().zip(v) {
                        cache.insert(id, vector);
                    }
                    debug!(target: "optimize", embedded = texts.len(), cached = cache.len(), "labeled set embedded");
                }
                Err(e) => {
                    warn!(
                        target: "optimize",
                        error = %e,
                        missing = texts.len(),
                        "embedding labeled set failed, novelty uses cached vectors only"
                    );
                }
            }
        }
        let cache = self.vectors.lock();
        let mut seen = HashSet::new();
        examples
            .iter()
            .filter(|e| seen.insert(e.article.id.as_str()))
            .filter_map(|e| cache.get(&e.article.id).cloned())
            .collect()
    }

    /// Number of labeled articles with a cached vector.
    pub fn cached_vectors(&self) -> usize {
        self.vectors.lock().len()
    }

    pub fn run_once(&self) -> Result<OptimizeOutcome> {
        self.run_once_at(Utc::now())
    }

    pub fn run_once_at(&self, now: DateTime<Utc>) -> Result<OptimizeOutcome> {
        let examples = self.log.load()?;
        let deployed = self.deployed()?;
        let trained_on = deployed.as_ref().map(|p| p.trained_on).unwrap_or(0);
        let pending = examples.len().saturating_sub(trained_on);
        let needed = self.cfg.batch_size.max(1);
        if pending < needed {
            debug!(target: "optimize", pending, needed, "waiting for more labels");
            return Ok(OptimizeOutcome::Waiting { pending, needed });
        }

        let split = training::split(&examples, self.cfg.validation_ratio);
        let version = deployed.as_ref().map(|p| p.version).unwrap_or(0);
        let incumbent = deployed.as_ref().map(|p| p.params.clone()).unwrap_or_else(|| self.base.clone());

        let candidate = compile::compile(&split.train, &incumbent, &self.rules);
        let old = compile::evaluate(&incumbent, &split.validation, &self.rules);
        let new = compile::evaluate(&candidate, &split.validation, &self.rules);

        if split.validation.is_empty() || new.score <= old.score {
            warn!(
                target: "optimize",
                version,
                candidate_score = new.score,
                deployed_score = old.score,
                validation = split.validation.len(),
                "recompiled version not better, keeping deployed"
            );
            // the attempt consumed these labels; wait for a fresh batch
            if let Some(mut p) = deployed {
                p.trained_on = split.version;
                p.save(&self.cfg.pointer_path)?;
            } else {
                DeployedPointer {
                    version: 0,
                    params: incumbent,
                    validation_score: old.score,
                    trained_on: split.version,
                    deployed_at: now,
                }
                .save(&self.cfg.pointer_path)?;
            }
            return Ok(OptimizeOutcome::Retained {
                version,
                candidate_score: new.score,
                deployed_score: old.score,
            });
        }

        let pointer = DeployedPointer {
            version: version + 1,
            params: candidate,
            validation_score: new.score,
            trained_on: split.version,
            deployed_at: now,
        };
        pointer.save(&self.cfg.pointer_path)?;
        self.live.set(pointer.params.clone());
        counter!("optimize_promotions_total").increment(1);
        info!(
            target: "optimize",
            version = pointer.version,
            validation_score = new.score,
            previous_score = old.score,
            f1 = new.f1,
            region_accuracy = new.region_accuracy,
            "recompiled version promoted"
        );
        Ok(OptimizeOutcome::Promoted {
            version: pointer.version,
            validation_score: new.score,
            previous_score: old.score,
        })
    }
}

// src/pipeline.rs
//! Bounded batch runner:
//!
//! Normalize → Dedup → Pre-filter → Classify + Score (fan-out) → Store (one commit)
//!
//! Per-article failures never abort a batch. Only store or configuration
//! failures do, and then nothing is committed. Cancellation is checkpointed:
//! before enrichment nothing is committed; once enrichment has started, every
//! article that fully finished classify + score is committed (with the dedup
//! and pre-filter results that depend only on finished work), and in-flight
//! articles are dropped so the next run retries them from the start.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::{Classifier, TaxonomyRules};
use crate::config::PipelineConfig;
use crate::dedup::{DedupParams, DedupVerdict, Deduplicator, Demotion};
use crate::error::{MalformedInputError, PipelineError};
use crate::ingest::config::SourcePriority;
use crate::ingest::{normalize_batch, RawDocument};
use crate::judge::embed::DynEmbedder;
use crate::judge::{DynJudge, ServiceGate};
use crate::model::{Article, Classification, DuplicateCluster, ShortlistEntry, Tier};
use crate::optimize::LiveParams;
use crate::prefilter::PrefilterHandle;
use crate::scoring::{Scored, Scorer};
use crate::store::{Rejection, Store, StoreBatch};

/// Cooperative cancellation checked between stages.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierCounts {
    pub shortlist: usize,
    pub review_queue: usize,
    pub discard: usize,
}

impl TierCounts {
    fn add(&mut self, t: Tier) {
        match t {
            Tier::Shortlist => self.shortlist += 1,
            Tier::ReviewQueue => self.review_queue += 1,
            Tier::Discard => self.discard += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub malformed: Vec<MalformedInputError>,
    /// Already stored, or repeated inside the batch.
    pub repeats: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub scored: usize,
    pub unclassified: usize,
    pub model_skipped: usize,
    pub tiers: TierCounts,
    /// Shortlist-tier articles of this batch, best first.
    pub shortlist: Vec<ShortlistEntry>,
    pub cancelled: bool,
}

/// Dedup output held back until the canonical it points at is committed.
#[derive(Default)]
struct Pending {
    batch: StoreBatch,
    /// Canonical ids of this batch that completed every stage.
    finished: HashSet<String>,
    duplicates: Vec<(Article, String)>,
    clusters: Vec<DuplicateCluster>,
    demotions: Vec<Demotion>,
}

impl Pending {
    /// Keep duplicates, clusters and demotions whose canonical is finished
    /// or already stored. The rest are rebuilt when the canonical is retried.
    fn into_batch(self, store: &Store, report: &mut BatchReport) -> StoreBatch {
        let Pending {
            mut batch,
            finished,
            duplicates,
            clusters,
            demotions,
        } = self;
        let settled = |id: &str| finished.contains(id) || store.contains(id);
        for (a, canonical_id) in duplicates {
            if settled(&canonical_id) {
                report.duplicates += 1;
                batch.put_duplicate(a, canonical_id);
            }
        }
        for c in clusters.into_iter().filter(|c| settled(&c.canonical_id)) {
            batch.cluster(c);
        }
        for d in demotions.into_iter().filter(|d| settled(&d.new_canonical_id)) {
            batch.demote(d);
        }
        batch
    }
}

pub struct Pipeline {
    cfg: PipelineConfig,
    store: Arc<Store>,
    priority: SourcePriority,
    prefilter: PrefilterHandle,
    classifier: Classifier,
    scorer: Scorer,
    live: LiveParams,
    /// One batch at a time: each batch rebuilds the dedup window from the store.
    running: tokio::sync::Mutex<()>,
}

/// Shared collaborators handed to `Pipeline::new`.
#[derive(Clone)]
pub struct Services {
    pub rules: Arc<TaxonomyRules>,
    pub prefilter: PrefilterHandle,
    pub embedder: DynEmbedder,
    pub judge: DynJudge,
    pub gate: ServiceGate,
    pub priority: SourcePriority,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig, store: Arc<Store>, services: Services) -> Self {
        let live = LiveParams::from_config(&cfg);
        let classifier = Classifier::new(
            services.rules,
            cfg.classifier.clone(),
            live.clone(),
            services.judge.clone(),
            services.gate.clone(),
        );
        let scorer = Scorer::new(
            &cfg.scoring,
            live.clone(),
            services.prefilter.clone(),
            services.embedder,
            services.judge,
            services.gate,
        );
        Self {
            cfg,
            store,
            priority: services.priority,
            prefilter: services.prefilter,
            classifier,
            scorer,
            live,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Parameters the classifier and scorer read; hand this to the optimizer
    /// so promotions reach the running pipeline.
    pub fn live_params(&self) -> &LiveParams {
        &self.live
    }

    pub async fn run_batch(&self, raws: &[RawDocument], cancel: &CancelFlag) -> Result<BatchReport, PipelineError> {
        self.run_batch_at(raws, cancel, Utc::now()).await
    }

    pub async fn run_batch_at(
        &self,
        raws: &[RawDocument],
        cancel: &CancelFlag,
        now: DateTime<Utc>,
    ) -> Result<BatchReport, PipelineError> {
        let _running = self.running.lock().await;
        let started = Instant::now();
        let mut report = BatchReport {
            received: raws.len(),
            ..BatchReport::default()
        };
        let cancelled = |report: &mut BatchReport, stage: &str| {
            warn!(target: "pipeline", stage, "batch cancelled, nothing committed");
            report.cancelled = true;
        };

        // normalize
        let (articles, malformed) = normalize_batch(raws, now);
        report.malformed = malformed;
        if cancel.is_cancelled() {
            cancelled(&mut report, "normalize");
            return Ok(report);
        }

        // dedup
        let fresh: Vec<Article> = articles
            .into_iter()
            .filter(|a| {
                let known = self.store.contains(&a.id);
                if known {
                    report.repeats += 1;
                }
                !known
            })
            .collect();
        let dedup = Deduplicator::new(DedupParams::from(&self.cfg.dedup), self.priority.clone());
        let params = dedup.params().clone();
        let seed = self.store.dedup_seed(now - params.retention);
        dedup.seed(seed.iter().map(|(a, d)| (a, d.as_deref())));
        dedup.evict(now);
        let dr = dedup.process_batch(fresh);
        let mut canonical = Vec::new();
        let mut pending = Pending {
            clusters: dr.clusters,
            demotions: dr.demotions,
            ..Pending::default()
        };
        for (a, verdict) in dr.tagged {
            match verdict {
                DedupVerdict::Canonical => canonical.push(a),
                DedupVerdict::DuplicateOf { canonical_id, .. } => pending.duplicates.push((a, canonical_id)),
                DedupVerdict::Repeat => report.repeats += 1,
            }
        }
        if cancel.is_cancelled() {
            cancelled(&mut report, "dedup");
            return Ok(report);
        }

        // pre-filter
        let mut survivors = Vec::with_capacity(canonical.len());
        for a in canonical {
            let outcome = self.prefilter.evaluate(&a.full_text());
            if outcome.passes {
                survivors.push(a);
            } else {
                counter!("triage_prefilter_rejected_total").increment(1);
                debug!(target: "prefilter", id = %a.id, confidence = outcome.confidence, "rejected");
                report.rejected += 1;
                pending.finished.insert(a.id.clone());
                pending.batch.put_rejected(a, Rejection::from_outcome(&outcome, now));
            }
        }
        if cancel.is_cancelled() {
            cancelled(&mut report, "prefilter");
            return Ok(report);
        }

        // classify + score; cancellation stops pulling new articles and drops in-flight ones
        let reputation = self.store.reputation();
        let limit = self.cfg.runtime.concurrency.max(1);
        let total = survivors.len();
        let mut enrich = stream::iter(survivors)
            .map(|a| {
                let rep = reputation.get(&a.source).cloned();
                async move {
                    let c = self.classifier.classify(&a).await;
                    let s = self.scorer.score(&a, &c, rep.as_ref()).await;
                    (a, c, s)
                }
            })
            .buffer_unordered(limit);
        let mut enriched: Vec<(Article, Classification, Scored)> = Vec::with_capacity(total);
        while let Some(done) = enrich.next().await {
            enriched.push(done);
            if cancel.is_cancelled() {
                break;
            }
        }
        drop(enrich);
        if enriched.len() < total {
            report.cancelled = true;
            warn!(
                target: "pipeline",
                stage = "enrich",
                finished = enriched.len(),
                dropped = total - enriched.len(),
                "batch cancelled, committing finished articles"
            );
        }

        let mut shortlist = Vec::new();
        for (a, c, s) in enriched {
            report.scored += 1;
            report.tiers.add(s.assessment.tier);
            if c.is_unclassified() {
                report.unclassified += 1;
            }
            if s.assessment.model_score.is_none() {
                report.model_skipped += 1;
            }
            if s.assessment.tier == Tier::Shortlist {
                shortlist.push(ShortlistEntry {
                    article_id: a.id.clone(),
                    title: a.title.clone(),
                    url: a.url.clone(),
                    region: c.region,
                    topics: c.topics.clone(),
                    composite_score: s.assessment.composite_score,
                    summary: a.summary.clone(),
                });
            }
            pending.finished.insert(a.id.clone());
            pending.batch.put(a, c, s.assessment, s.embedding);
        }
        shortlist.sort_by(|a, b| {
            b.composite_score
                .total_cmp(&a.composite_score)
                .then_with(|| a.article_id.cmp(&b.article_id))
        });
        report.shortlist = shortlist;
        let batch = pending.into_batch(&self.store, &mut report);

        // store
        let summary = self.store.commit_at(batch, now)?;
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("triage_batch_duration_ms").record(ms);
        info!(
            target: "pipeline",
            received = report.received,
            malformed = report.malformed.len(),
            duplicates = report.duplicates,
            rejected = report.rejected,
            scored = report.scored,
            shortlist = report.tiers.shortlist,
            inserted = summary.inserted,
            ms,
            "batch committed"
        );
        Ok(report)
    }
}

// src/optimize/compile.rs
//! "Recompilation" of the tunable classifier/scorer parameters against a
//! labeled training split, plus the validation metrics used to decide
//! promotion.
//!
//! Scorer tuning replays the signals captured when each example was stored,
//! so no external service is called here.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::classify::{classify_lexical, TaxonomyRules};
use crate::config::{FewShot, PipelineConfig};
use crate::model::{Region, Tier, TrainingExample};
use crate::scoring::ScoringParams;

const MAX_FEW_SHOT: usize = 6;
const REGION_WEIGHT_GRID: [f32; 6] = [0.5, 1.0, 1.5, 2.0, 2.5, 3.0];
const HIGH_THRESHOLD_GRID: [f32; 7] = [0.45, 0.5, 0.55, 0.6, 0.65, 0.7, 0.75];

/// Everything the optimizer is allowed to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledParams {
    pub scoring: ScoringParams,
    pub region_min_weight: f32,
    #[serde(default)]
    pub few_shot: Vec<FewShot>,
}

impl CompiledParams {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            scoring: ScoringParams::from(&cfg.scoring),
            region_min_weight: cfg.classifier.region_min_weight,
            few_shot: cfg.classifier.few_shot.clone(),
        }
    }

    pub fn apply_to(&self, cfg: &mut PipelineConfig) {
        self.scoring.apply_to(&mut cfg.scoring);
        cfg.classifier.region_min_weight = self.region_min_weight;
        cfg.classifier.few_shot = self.few_shot.clone();
    }
}

/// Deployed parameters shared by the running classifier and scorer. A
/// promotion swaps the value in place, so articles processed after it see the
/// new parameters without a restart.
#[derive(Debug, Clone)]
pub struct LiveParams(Arc<RwLock<CompiledParams>>);

impl LiveParams {
    pub fn new(params: CompiledParams) -> Self {
        Self(Arc::new(RwLock::new(params)))
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(CompiledParams::from_config(cfg))
    }

    /// Short-lived read; do not hold across an await.
    pub fn read(&self) -> RwLockReadGuard<'_, CompiledParams> {
        self.0.read()
    }

    pub fn get(&self) -> CompiledParams {
        self.0.read().clone()
    }

    pub fn scoring(&self) -> ScoringParams {
        self.0.read().scoring
    }

    pub fn set(&self, params: CompiledParams) {
        *self.0.write() = params;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ValidationMetrics {
    /// Shortlist precision over examples with captured signals.
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub region_accuracy: f32,
    pub relevance_examples: usize,
    pub region_examples: usize,
    /// Single number compared at promotion time.
    pub score: f32,
}

#[derive(Default)]
struct Confusion {
    tp: u32,
    fp: u32,
    fn_: u32,
    n: usize,
}

impl Confusion {
    fn precision(&self) -> f32 {
        match self.tp + self.fp {
            0 if self.fn_ == 0 => 1.0,
            0 => 0.0,
            d => self.tp as f32 / d as f32,
        }
    }

    fn recall(&self) -> f32 {
        match self.tp + self.fn_ {
            0 => 1.0,
            d => self.tp as f32 / d as f32,
        }
    }

    fn f1(&self) -> f32 {
        let (p, r) = (self.precision(), self.recall());
        if p + r <= f32::EPSILON {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

fn shortlist_confusion(scoring: &ScoringParams, examples: &[TrainingExample]) -> Confusion {
    let mut c = Confusion::default();
    for ex in examples {
        let Some(sig) = ex.signals else { continue };
        c.n += 1;
        // same prior the live scorer applied, from the acceptance captured at labeling
        let composite = scoring.with_prior(
            scoring.composite(sig.lexical, sig.semantic, sig.model),
            sig.source_acceptance,
        );
        let predicted = scoring.tier(composite) == Tier::Shortlist;
        let actual = ex.relevance == Tier::Shortlist;
        match (predicted, actual) {
            (true, true) => c.tp += 1,
            (true, false) => c.fp += 1,
            (false, true) => c.fn_ += 1,
            (false, false) => {}
        }
    }
    c
}

/// (correct, total) over examples with a real ground-truth region.
fn region_hits(rules: &TaxonomyRules, min_weight: f32, examples: &[TrainingExample]) -> (usize, usize) {
    let mut hits = 0;
    let mut total = 0;
    for ex in examples.iter().filter(|e| !e.classification.is_unclassified()) {
        total += 1;
        if classify_lexical(rules, &ex.article, min_weight).region.region == ex.classification.region {
            hits += 1;
        }
    }
    (hits, total)
}

pub fn evaluate(params: &CompiledParams, examples: &[TrainingExample], rules: &TaxonomyRules) -> ValidationMetrics {
    let c = shortlist_confusion(&params.scoring, examples);
    let (hits, total) = region_hits(rules, params.region_min_weight, examples);
    let region_accuracy = if total == 0 { 0.0 } else { hits as f32 / total as f32 };
    let f1 = c.f1();
    let score = match (c.n > 0, total > 0) {
        (true, true) => 0.7 * f1 + 0.3 * region_accuracy,
        (true, false) => f1,
        (false, true) => region_accuracy,
        (false, false) => 0.0,
    };
    ValidationMetrics {
        precision: c.precision(),
        recall: c.recall(),
        f1,
        region_accuracy,
        relevance_examples: c.n,
        region_examples: total,
        score,
    }
}

/// Candidate scorer parameters: weights on a 0.1 grid summing to 1, with the
/// shortlist threshold swept and the review threshold kept below it.
fn scoring_grid(start: &ScoringParams) -> Vec<ScoringParams> {
    let mut out = Vec::new();
    for l in 1..=6u8 {
        for s in 1..=6u8 {
            if l + s > 9 {
                continue;
            }
            let m = 10 - l - s;
            for &high in &HIGH_THRESHOLD_GRID {
                out.push(ScoringParams {
                    lexical_weight: l as f32 / 10.0,
                    semantic_weight: s as f32 / 10.0,
                    model_weight: m as f32 / 10.0,
                    high_threshold: high,
                    low_threshold: start.low_threshold.min(high - 0.05),
                    prior_weight: start.prior_weight,
                });
            }
        }
    }
    out
}

/// Grid search from `start`. The incumbent wins ties, so parameters only move
/// when the training split strictly prefers the change.
pub fn compile(train: &[TrainingExample], start: &CompiledParams, rules: &TaxonomyRules) -> CompiledParams {
    let mut best_scoring = start.scoring;
    let mut best_f1 = shortlist_confusion(&best_scoring, train).f1();
    for cand in scoring_grid(&start.scoring) {
        let f1 = shortlist_confusion(&cand, train).f1();
        if f1 > best_f1 + 1e-6 {
            best_f1 = f1;
            best_scoring = cand;
        }
    }

    let acc = |w: f32| {
        let (h, t) = region_hits(rules, w, train);
        if t == 0 {
            0.0
        } else {
            h as f32 / t as f32
        }
    };
    let mut best_weight = start.region_min_weight;
    let mut best_acc = acc(best_weight);
    for &w in &REGION_WEIGHT_GRID {
        let a = acc(w);
        if a > best_acc + 1e-6 {
            best_acc = a;
            best_weight = w;
        }
    }

    CompiledParams {
        scoring: best_scoring,
        region_min_weight: best_weight,
        few_shot: select_few_shot(train).unwrap_or_else(|| start.few_shot.clone()),
    }
}

/// One recent example per region, relevant ones first.
fn select_few_shot(train: &[TrainingExample]) -> Option<Vec<FewShot>> {
    let mut pool: Vec<&TrainingExample> = train
        .iter()
        .filter(|e| !e.classification.is_unclassified() && !e.classification.topics.is_empty())
        .collect();
    pool.sort_by(|a, b| {
        (b.relevance == Tier::Shortlist)
            .cmp(&(a.relevance == Tier::Shortlist))
            .then_with(|| b.labeled_at.cmp(&a.labeled_at))
            .then_with(|| a.article.id.cmp(&b.article.id))
    });
    let mut seen: Vec<Region> = Vec::new();
    let mut out = Vec::new();
    for ex in pool {
        if seen.contains(&ex.classification.region) {
            continue;
        }
        seen.push(ex.classification.region);
        out.push(FewShot {
            title: ex.article.title.clone(),
            region: ex.classification.region.as_str().to_string(),
            topics: ex.classification.topics.iter().map(|t| t.as_str().to_string()).collect(),
        });
        if out.len() == MAX_FEW_SHOT {
            break;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

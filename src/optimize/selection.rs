// src/optimize/selection.rs
//! Labeling-candidate priority:
//!
//! priority = a * uncertainty + b * novelty + c * drift
//!
//! uncertainty is the larger of the classification entropy and the tier
//! entropy, novelty is the cosine distance to the closest labeled example, and
//! drift is the source's recent acceptance-rate deviation.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::OptimizeConfig;
use crate::judge::cosine_similarity;
use crate::model::{clamp01, Tier};
use crate::reputation::ReputationTable;
use crate::scoring::ScoringParams;
use crate::store::StoredArticle;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelCandidate {
    pub article_id: String,
    pub title: String,
    pub source: String,
    pub tier: Option<Tier>,
    pub priority: f32,
    pub uncertainty: f32,
    pub novelty: f32,
    pub drift: f32,
}

/// Shannon entropy of a distribution, normalized to [0, 1] by log2(n).
pub fn entropy(p: &[f32]) -> f32 {
    if p.len() < 2 {
        return 0.0;
    }
    let total: f32 = p.iter().filter(|x| **x > 0.0).sum();
    if total <= f32::EPSILON {
        return 0.0;
    }
    let h: f32 = p
        .iter()
        .filter(|x| **x > 0.0)
        .map(|x| {
            let q = x / total;
            -q * q.log2()
        })
        .sum();
    clamp01(h / (p.len() as f32).log2())
}

/// Soft tier membership from the composite: mass concentrates on one tier far
/// from the thresholds and splits near them.
fn tier_distribution(composite: f32, params: &ScoringParams) -> [f32; 3] {
    const SPREAD: f32 = 0.08;
    let up = |t: f32| 1.0 / (1.0 + (-(composite - t) / SPREAD).exp());
    let above_high = up(params.high_threshold);
    let above_low = up(params.low_threshold);
    [above_high, (above_low - above_high).max(0.0), 1.0 - above_low]
}

pub fn uncertainty(s: &StoredArticle, params: &ScoringParams) -> f32 {
    let class = match s.classification() {
        Some(c) if !c.is_unclassified() => entropy(&[c.confidence, 1.0 - c.confidence]),
        _ => 1.0,
    };
    let tier = s
        .assessment
        .as_ref()
        .map(|a| entropy(&tier_distribution(a.composite_score, params)))
        .unwrap_or(1.0);
    class.max(tier)
}

/// 1 - max cosine similarity to the labeled set; 1 when nothing to compare.
pub fn novelty(embedding: Option<&[f32]>, labeled: &[Vec<f32>]) -> f32 {
    let Some(e) = embedding else { return 1.0 };
    labeled
        .iter()
        .map(|l| cosine_similarity(e, l))
        .fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.max(s))))
        .map(|best| clamp01(1.0 - best))
        .unwrap_or(1.0)
}

/// Rank stored candidates for labeling, skipping already-labeled ids.
pub fn prioritize(
    candidates: Vec<StoredArticle>,
    labeled_ids: &HashSet<String>,
    labeled_vectors: &[Vec<f32>],
    reputation: &ReputationTable,
    params: &ScoringParams,
    cfg: &OptimizeConfig,
) -> Vec<LabelCandidate> {
    let mut out: Vec<LabelCandidate> = candidates
        .into_iter()
        .filter(|s| !labeled_ids.contains(&s.article.id))
        .map(|s| {
            let u = uncertainty(&s, params);
            let n = novelty(s.embedding.as_deref(), labeled_vectors);
            // drift is an absolute rate gap; double it so 0.5 saturates
            let d = clamp01(2.0 * reputation.drift(&s.article.source));
            LabelCandidate {
                priority: cfg.uncertainty_weight * u + cfg.novelty_weight * n + cfg.drift_weight * d,
                uncertainty: u,
                novelty: n,
                drift: d,
                tier: s.tier(),
                article_id: s.article.id,
                title: s.article.title,
                source: s.article.source,
            }
        })
        .collect();
    out.sort_by(|a, b| b.priority.total_cmp(&a.priority).then_with(|| a.article_id.cmp(&b.article_id)));
    out.truncate(cfg.select_limit);
    out
}

// src/store/query.rs
//! Hybrid retrieval: exact metadata filtering plus vector similarity ranking.
//!
//! Filters are hard constraints: a candidate that fails any of them is never
//! returned, however close its vector is.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::StoredArticle;
use crate::judge::cosine_similarity;
use crate::model::{clamp01, Article, Classification, RelevanceAssessment, Region, Tier, Topic};
use crate::reputation::source_key;

/// Tiers returned when a query names none. Discarded articles stay in storage
/// but are excluded from query defaults.
pub const DEFAULT_TIERS: [Tier; 2] = [Tier::Shortlist, Tier::ReviewQueue];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreFilter {
    pub region: Option<Region>,
    /// Any-of match against the article's topics.
    pub topics: BTreeSet<Topic>,
    pub published_after: Option<DateTime<Utc>>,
    pub published_before: Option<DateTime<Utc>>,
    /// `None` means `DEFAULT_TIERS`.
    pub tiers: Option<BTreeSet<Tier>>,
    pub sources: BTreeSet<String>,
    pub include_duplicates: bool,
    /// Also search the cold partition.
    pub include_historical: bool,
}

impl StoreFilter {
    pub fn tiers(&self) -> BTreeSet<Tier> {
        self.tiers
            .clone()
            .unwrap_or_else(|| DEFAULT_TIERS.into_iter().collect())
    }

    /// True when only tier defaults constrain the query.
    pub fn is_unconstrained(&self) -> bool {
        self.region.is_none()
            && self.topics.is_empty()
            && self.published_after.is_none()
            && self.published_before.is_none()
            && self.sources.is_empty()
    }

    /// Every constraint must hold. Rejected articles never match.
    pub fn matches(&self, s: &StoredArticle) -> bool {
        if s.rejection.is_some() {
            return false;
        }
        if s.duplicate_of.is_some() && !self.include_duplicates {
            return false;
        }
        let a = &s.article;
        if let Some(after) = self.published_after {
            if a.published_at < after {
                return false;
            }
        }
        if let Some(before) = self.published_before {
            if a.published_at >= before {
                return false;
            }
        }
        if !self.sources.is_empty() && !self.sources.iter().any(|src| source_key(src) == source_key(&a.source)) {
            return false;
        }

        let tiers = self.tiers();
        match &s.assessment {
            Some(asm) if tiers.contains(&asm.tier) => {}
            _ => return false,
        }

        let needs_labels = self.region.is_some() || !self.topics.is_empty();
        if needs_labels {
            let Some(c) = s.classification() else {
                return false;
            };
            if let Some(r) = self.region {
                if c.region != r {
                    return false;
                }
            }
            if !self.topics.is_empty() && c.topics.is_disjoint(&self.topics) {
                return false;
            }
        }
        true
    }

    /// True when the date range reaches back past `cutoff`.
    pub fn reaches_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.include_historical || self.published_after.is_some_and(|after| after < cutoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankWeights {
    pub vector: f32,
    pub metadata: f32,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            metadata: 0.4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreQuery {
    pub filter: StoreFilter,
    pub vector: Option<Vec<f32>>,
    pub k: usize,
    pub weights: RankWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub article: Article,
    pub classification: Option<Classification>,
    pub assessment: Option<RelevanceAssessment>,
    pub vector_score: f32,
    pub metadata_score: f32,
    pub score: f32,
}

/// Recency half-scale for the metadata score.
const RECENCY_SCALE_DAYS: f32 = 30.0;

/// Metadata match in [0, 1]: topic overlap, stored relevance and recency.
pub fn metadata_score(filter: &StoreFilter, s: &StoredArticle, now: DateTime<Utc>) -> f32 {
    let overlap = match s.classification() {
        Some(c) if !filter.topics.is_empty() => {
            let hit = c.topics.intersection(&filter.topics).count() as f32;
            0.5 + 0.5 * hit / filter.topics.len() as f32
        }
        Some(_) => 1.0,
        None => 0.0,
    };
    let relevance = s.assessment.as_ref().map(|a| a.composite_score).unwrap_or(0.0);
    let age_days = (now - s.article.published_at).num_hours().max(0) as f32 / 24.0;
    let recency = (-age_days / RECENCY_SCALE_DAYS).exp();
    clamp01(0.4 * overlap + 0.4 * relevance + 0.2 * recency)
}

pub(crate) fn rank<'a, I>(items: I, q: &StoreQuery, now: DateTime<Utc>) -> Vec<Candidate>
where
    I: IntoIterator<Item = &'a StoredArticle>,
{
    if q.k == 0 {
        return Vec::new();
    }
    let wv = q.weights.vector.max(0.0);
    let wm = q.weights.metadata.max(0.0);

    let mut out: Vec<Candidate> = items
        .into_iter()
        .filter(|s| q.filter.matches(s))
        .map(|s| {
            let vector_score = match (&q.vector, &s.embedding) {
                (Some(qv), Some(ev)) => cosine_similarity(qv, ev).max(0.0),
                _ => 0.0,
            };
            let metadata_score = metadata_score(&q.filter, s, now);
            let score = match &q.vector {
                Some(_) if wv + wm > f32::EPSILON => (wv * vector_score + wm * metadata_score) / (wv + wm),
                _ => metadata_score,
            };
            Candidate {
                article: s.article.clone(),
                classification: s.classification().cloned(),
                assessment: s.assessment.clone(),
                vector_score,
                metadata_score,
                score,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.article.published_at.cmp(&a.article.published_at))
            .then_with(|| a.article.id.cmp(&b.article.id))
    });
    out.truncate(q.k);
    out
}

/// `[now - days, now)` as a filter range.
pub fn last_days(now: DateTime<Utc>, days: i64) -> (DateTime<Utc>, DateTime<Utc>) {
    (now - Duration::days(days.max(0)), now + Duration::seconds(1))
}

// src/scoring.rs
//! Continuous relevance scoring.
//!
//! composite = (wl*lexical + ws*semantic + wm*model) / (wl + ws + wm)
//!
//! When the model signal is absent (skipped or timed out) its weight drops out
//! of both sums. Every weight is non-negative, so the composite never decreases
//! when one signal grows and the others hold still.

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::ScoringConfig;
use crate::error::ServiceError;
use crate::judge::embed::DynEmbedder;
use crate::judge::{cosine_similarity, strip_fences, DynJudge, JudgmentRequest, JudgmentTask, ServiceGate};
use crate::model::{clamp01, Article, Classification, RelevanceAssessment, Tier};
use crate::optimize::LiveParams;
use crate::prefilter::PrefilterHandle;
use crate::reputation::{blend_prior, SourceReputation};

/// Tunable part of the scorer. This is what the optimizer recompiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringParams {
    pub lexical_weight: f32,
    pub semantic_weight: f32,
    pub model_weight: f32,
    pub high_threshold: f32,
    pub low_threshold: f32,
    /// Pull of the source's acceptance rate on the composite.
    #[serde(default = "default_prior_weight")]
    pub prior_weight: f32,
}

fn default_prior_weight() -> f32 {
    ScoringConfig::default().reputation_prior_weight
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self::from(&ScoringConfig::default())
    }
}

impl From<&ScoringConfig> for ScoringParams {
    fn from(c: &ScoringConfig) -> Self {
        Self {
            lexical_weight: c.lexical_weight.max(0.0),
            semantic_weight: c.semantic_weight.max(0.0),
            model_weight: c.model_weight.max(0.0),
            high_threshold: c.high_threshold,
            low_threshold: c.low_threshold.min(c.high_threshold),
            prior_weight: c.reputation_prior_weight.clamp(0.0, 1.0),
        }
    }
}

impl ScoringParams {
    /// Normalized weighted mean of the available signals, in [0, 1].
    pub fn composite(&self, lexical: f32, semantic: f32, model: Option<f32>) -> f32 {
        let mut num = self.lexical_weight * clamp01(lexical) + self.semantic_weight * clamp01(semantic);
        let mut denom = self.lexical_weight + self.semantic_weight;
        if let Some(m) = model {
            num += self.model_weight * clamp01(m);
            denom += self.model_weight;
        }
        if denom <= f32::EPSILON {
            return 0.0;
        }
        clamp01(num / denom)
    }

    pub fn tier(&self, composite: f32) -> Tier {
        tier_for(composite, self.high_threshold, self.low_threshold)
    }

    /// Composite after the source reputation prior, when there is one.
    pub fn with_prior(&self, composite: f32, source_acceptance: Option<f32>) -> f32 {
        match source_acceptance {
            Some(acc) if self.prior_weight > 0.0 => blend_prior(composite, acc, self.prior_weight),
            _ => composite,
        }
    }

    /// Copy the tunables back into a scoring config section.
    pub fn apply_to(&self, cfg: &mut ScoringConfig) {
        cfg.lexical_weight = self.lexical_weight;
        cfg.semantic_weight = self.semantic_weight;
        cfg.model_weight = self.model_weight;
        cfg.high_threshold = self.high_threshold;
        cfg.low_threshold = self.low_threshold;
        cfg.reputation_prior_weight = self.prior_weight;
    }
}

/// Pure function of the composite: `>= high` shortlist, `>= low` review, else discard.
pub fn tier_for(composite: f32, high: f32, low: f32) -> Tier {
    if composite >= high {
        Tier::Shortlist
    } else if composite >= low {
        Tier::ReviewQueue
    } else {
        Tier::Discard
    }
}

#[derive(Deserialize)]
struct RelevanceOut {
    score: f32,
}

/// `{"score": f}` → score in [0, 1].
pub fn parse_relevance_output(raw: &str) -> Result<f32, ServiceError> {
    let out: RelevanceOut = serde_json::from_str(strip_fences(raw))
        .map_err(|e| ServiceError::BadResponse(format!("relevance: {e}")))?;
    if !out.score.is_finite() {
        return Err(ServiceError::BadResponse("relevance: non-finite score".into()));
    }
    Ok(clamp01(out.score))
}

/// Assessment plus the article embedding computed on the way.
#[derive(Debug, Clone)]
pub struct Scored {
    pub assessment: RelevanceAssessment,
    pub embedding: Option<Vec<f32>>,
}

pub struct Scorer {
    /// Read per article, so a promotion applies to the next one scored.
    live: LiveParams,
    min_signal_bar: f32,
    saturation: f32,
    exemplar_texts: Vec<String>,
    exemplars: OnceCell<Vec<Vec<f32>>>,
    prefilter: PrefilterHandle,
    embedder: DynEmbedder,
    judge: DynJudge,
    gate: ServiceGate,
}

impl Scorer {
    pub fn new(
        cfg: &ScoringConfig,
        live: LiveParams,
        prefilter: PrefilterHandle,
        embedder: DynEmbedder,
        judge: DynJudge,
        gate: ServiceGate,
    ) -> Self {
        Self {
            live,
            min_signal_bar: cfg.min_signal_bar,
            saturation: cfg.density_saturation,
            exemplar_texts: cfg
                .exemplars
                .iter()
                .map(|e| format!("{}. {}", e.title, e.text))
                .collect(),
            exemplars: OnceCell::new(),
            prefilter,
            embedder,
            judge,
            gate,
        }
    }

    pub fn params(&self) -> ScoringParams {
        self.live.scoring()
    }

    /// Embed a single text through the gate.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let texts = [text.to_string()];
        let mut v = self.gate.run("embeddings", self.embedder.embed(&texts)).await?;
        v.pop()
            .ok_or_else(|| ServiceError::BadResponse("embeddings: empty result".into()))
    }

    /// Exemplar vectors, embedded once. A failed attempt is retried on the next call.
    async fn exemplar_vectors(&self) -> Option<&Vec<Vec<f32>>> {
        match self
            .exemplars
            .get_or_try_init(|| async { self.gate.run("embeddings", self.embedder.embed(&self.exemplar_texts)).await })
            .await
        {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(target: "scorer", error = %e, "exemplar embedding failed");
                None
            }
        }
    }

    pub fn semantic_score(embedding: &[f32], exemplars: &[Vec<f32>]) -> f32 {
        exemplars
            .iter()
            .map(|e| cosine_similarity(embedding, e))
            .fold(0.0f32, f32::max)
    }

    fn local_estimate(lexical: f32, classification: &Classification) -> f32 {
        let topical = if classification.is_unclassified() {
            0.0
        } else if classification.has_regulatory_topic() {
            1.0
        } else {
            0.5
        };
        clamp01(0.6 * lexical + 0.4 * topical)
    }

    async fn model_score(&self, article: &Article, classification: &Classification, lexical: f32) -> Option<f32> {
        let system = "Rate how relevant a news article is to employment background screening \
                      (criminal records, credit checks, drug testing, right to work, privacy \
                      regulation of vetting). Reply with JSON {\"score\": number between 0 and 1}.";
        let topics: Vec<&str> = classification.topics.iter().map(|t| t.as_str()).collect();
        let user = format!(
            "Region: {}\nTopics: {}\nTitle: {}\nSummary: {}",
            classification.region,
            topics.join(", "),
            article.title,
            article.summary
        );
        let hint = json!({ "score": Self::local_estimate(lexical, classification) });
        let req = JudgmentRequest::new(JudgmentTask::Relevance, system, user).with_hint(hint.to_string());

        match self.gate.run("judge", self.judge.complete(&req)).await {
            Ok(raw) => match parse_relevance_output(&raw) {
                Ok(s) => Some(s),
                Err(e) => {
                    debug!(target: "scorer", id = %article.id, error = %e, "model score unusable");
                    None
                }
            },
            Err(e) => {
                debug!(target: "scorer", id = %article.id, error = %e, timeout = e.is_timeout(), "model score unavailable");
                None
            }
        }
    }

    pub async fn score(
        &self,
        article: &Article,
        classification: &Classification,
        reputation: Option<&SourceReputation>,
    ) -> Scored {
        let lexical = self.prefilter.keyword_density(&article.full_text(), self.saturation);

        let embedding = match self.embed(&article.embedding_text()).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(target: "scorer", id = %article.id, error = %e, "article embedding failed");
                None
            }
        };
        let semantic = match (&embedding, self.exemplar_vectors().await) {
            (Some(v), Some(ex)) => Self::semantic_score(v, ex),
            _ => 0.0,
        };

        let model = if lexical < self.min_signal_bar && semantic < self.min_signal_bar {
            counter!("triage_model_skipped_total").increment(1);
            debug!(target: "scorer", id = %article.id, lexical, semantic, "cheap signals below bar, model skipped");
            None
        } else {
            self.model_score(article, classification, lexical).await
        };

        let params = self.params();
        let composite = params.with_prior(
            params.composite(lexical, semantic, model),
            reputation.map(SourceReputation::acceptance_rate),
        );
        let tier = params.tier(composite);
        counter!("triage_tier_total", "tier" => tier.as_str()).increment(1);
        debug!(target: "scorer", id = %article.id, lexical, semantic, ?model, composite, tier = tier.as_str(), "scored");

        Scored {
            assessment: RelevanceAssessment {
                lexical_score: lexical,
                semantic_score: semantic,
                model_score: model,
                composite_score: composite,
                tier,
            },
            embedding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::judge::{HashingEmbedder, MockJudge};
    use crate::model::{Region, Topic};
    use crate::prefilter::PrefilterEngine;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn article(title: &str, body: &str) -> Article {
        Article {
            id: "id".into(),
            title: title.into(),
            body: body.into(),
            url: "https://x.test".into(),
            source: "X".into(),
            published_at: Utc::now(),
            language: "en".into(),
            summary: body.chars().take(200).collect(),
        }
    }

    fn classification() -> Classification {
        Classification::new(Region::NorthAmerica, [Topic::Legislation].into_iter().collect(), 0.8, "t").unwrap()
    }

    fn scorer(judge: MockJudge, timeout: Duration) -> (Scorer, Arc<MockJudge>) {
        let judge = Arc::new(judge);
        let mut cfg = PipelineConfig::default();
        cfg.scoring.reputation_prior_weight = 0.0;
        let s = Scorer::new(
            &cfg.scoring,
            LiveParams::from_config(&cfg),
            PrefilterHandle::new(PrefilterEngine::builtin().unwrap()),
            Arc::new(HashingEmbedder::default()),
            judge.clone(),
            ServiceGate::new(4, timeout),
        );
        (s, judge)
    }

    #[test]
    fn composite_is_monotonic_in_each_signal() {
        let p = ScoringParams::default();
        let grid = [0.0, 0.1, 0.3, 0.5, 0.7, 0.9, 1.0];
        for &a in &grid {
            for &b in &grid {
                for w in grid.windows(2) {
                    let (lo, hi) = (w[0], w[1]);
                    assert!(p.composite(lo, a, Some(b)) <= p.composite(hi, a, Some(b)));
                    assert!(p.composite(a, lo, Some(b)) <= p.composite(a, hi, Some(b)));
                    assert!(p.composite(a, b, Some(lo)) <= p.composite(a, b, Some(hi)));
                    assert!(p.composite(lo, a, None) <= p.composite(hi, a, None));
                }
            }
        }
    }

    #[test]
    fn missing_model_renormalizes_over_cheap_signals() {
        let p = ScoringParams::default();
        assert!((p.composite(0.8, 0.4, None) - 0.6).abs() < 1e-6);
        assert!((p.composite(1.0, 1.0, Some(1.0)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tiers_partition_the_unit_interval() {
        let p = ScoringParams::default();
        assert_eq!(p.tier(p.high_threshold), Tier::Shortlist);
        assert_eq!(p.tier(p.high_threshold - 1e-4), Tier::ReviewQueue);
        assert_eq!(p.tier(p.low_threshold), Tier::ReviewQueue);
        assert_eq!(p.tier(p.low_threshold - 1e-4), Tier::Discard);
        assert_eq!(p.tier(0.0), Tier::Discard);
        assert_eq!(p.tier(1.0), Tier::Shortlist);
    }

    #[test]
    fn relevance_output_is_validated() {
        assert_eq!(parse_relevance_output(r#"{"score":1.4}"#).unwrap(), 1.0);
        assert!(parse_relevance_output(r#"{"relevance":1}"#).is_err());
    }

    #[tokio::test]
    async fn weak_cheap_signals_skip_the_model() {
        let (s, judge) = scorer(MockJudge::new(), Duration::from_secs(1));
        let out = s
            .score(&article("Weekend football", "The league table after the weekend matches."), &classification(), None)
            .await;
        assert_eq!(out.assessment.model_score, None);
        assert!(judge.calls().is_empty());
        assert_eq!(out.assessment.tier, Tier::Discard);
    }

    #[tokio::test]
    async fn model_timeout_falls_back_to_cheap_signals() {
        let (s, _) = scorer(MockJudge::new().with_delay(Duration::from_millis(300)), Duration::from_millis(30));
        let a = article(
            "State expands ban the box law for employers",
            "New legislation restricts when employers may ask about criminal history during background checks.",
        );
        let out = s.score(&a, &classification(), None).await;
        assert_eq!(out.assessment.model_score, None);
        let p = s.params();
        let expected = p.composite(out.assessment.lexical_score, out.assessment.semantic_score, None);
        assert!((out.assessment.composite_score - expected).abs() < 1e-6);
        assert!(out.embedding.is_some());
    }

    #[test]
    fn prior_pulls_toward_source_acceptance() {
        let p = ScoringParams {
            prior_weight: 0.5,
            ..ScoringParams::default()
        };
        assert!((p.with_prior(0.8, Some(0.2)) - 0.5).abs() < 1e-6);
        assert_eq!(p.with_prior(0.8, None), 0.8);
        let off = ScoringParams {
            prior_weight: 0.0,
            ..p
        };
        assert_eq!(off.with_prior(0.8, Some(0.2)), 0.8);
    }

    #[tokio::test]
    async fn promoted_thresholds_apply_to_the_next_article() {
        let (s, _) = scorer(MockJudge::new(), Duration::from_secs(1));
        let a = article(
            "State expands ban the box law for employers",
            "New legislation restricts when employers may ask about criminal history and \
             conviction records during hiring and background checks.",
        );
        let before = s.score(&a, &classification(), None).await;
        assert_eq!(before.assessment.tier, Tier::Shortlist);

        let mut promoted = s.live.get();
        promoted.scoring.high_threshold = 1.0;
        promoted.scoring.low_threshold = 0.99;
        s.live.set(promoted);
        let after = s.score(&a, &classification(), None).await;
        assert_eq!(after.assessment.tier, Tier::Discard);
    }

    #[tokio::test]
    async fn strong_article_reaches_shortlist() {
        let (s, judge) = scorer(MockJudge::new(), Duration::from_secs(1));
        let a = article(
            "State expands ban the box law for employers",
            "New legislation restricts when employers may ask about criminal history and \
             conviction records during hiring and background checks.",
        );
        let out = s.score(&a, &classification(), None).await;
        assert!(out.assessment.model_score.is_some());
        assert_eq!(judge.calls(), vec![JudgmentTask::Relevance]);
        assert_eq!(out.assessment.tier, Tier::Shortlist);
    }
}

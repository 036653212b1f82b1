// src/classify/mod.rs
//! Two-stage classifier: region first, then topics conditioned on that region.
//!
//! Lexical rules give a deterministic first answer. When enabled, the judgment
//! model refines each stage; its output crosses a schema-validation boundary
//! into the closed taxonomy. Schema-invalid output gets one retry with the full
//! body as context, then the whole classification falls back to `unclassified`.
//! Service failures (timeout, unavailable) keep the lexical answer.

pub mod rules;

use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::error::{ClassificationError, ServiceError};
use crate::judge::{strip_fences, DynJudge, JudgmentRequest, JudgmentTask, ServiceGate};
use crate::model::{Article, Classification, Region, Topic};
use crate::optimize::LiveParams;
pub use rules::{RegionEvidence, TaxonomyRules, TopicEvidence};

/// Lexical-only result, also used offline by the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalClassification {
    pub region: RegionEvidence,
    pub topics: TopicEvidence,
}

impl LexicalClassification {
    pub fn to_classification(&self) -> Classification {
        Classification {
            region: self.region.region,
            topics: self.topics.topics.clone(),
            confidence: ((self.region.confidence + self.topics.confidence) / 2.0).clamp(0.0, 1.0),
            rationale: format!(
                "lexical region [{}]; topics [{}]",
                self.region.matched.join(","),
                self.topics.matched.join(",")
            ),
            version: 1,
        }
    }
}

pub fn classify_lexical(rules: &TaxonomyRules, article: &Article, region_min_weight: f32) -> LexicalClassification {
    let text = article.full_text();
    let region = rules.region(&text, region_min_weight);
    let topics = rules.topics(&text, region.region);
    LexicalClassification { region, topics }
}

/* ----------------------------
Schema validation of model output
---------------------------- */

#[derive(Deserialize)]
struct RegionOut {
    region: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    rationale: Option<String>,
}

#[derive(Deserialize)]
struct TopicsOut {
    topics: Vec<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    rationale: Option<String>,
}

fn conf_or(c: Option<f32>, fallback: f32) -> f32 {
    match c {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => fallback,
    }
}

/// `{"region": "...", "confidence": f, "rationale": "..."}` → assignable region.
pub fn parse_region_output(raw: &str) -> Result<(Region, f32, String), ClassificationError> {
    let out: RegionOut = serde_json::from_str(strip_fences(raw))
        .map_err(|e| ClassificationError::Unparseable(e.to_string()))?;
    let region: Region = out.region.parse()?;
    if region == Region::Unclassified {
        return Err(ClassificationError::InvalidLabel {
            kind: "region",
            value: out.region,
        });
    }
    Ok((region, conf_or(out.confidence, 0.5), out.rationale.unwrap_or_default()))
}

/// `{"topics": [...], ...}` → non-empty subset of the topic set.
pub fn parse_topics_output(raw: &str) -> Result<(BTreeSet<Topic>, f32, String), ClassificationError> {
    let out: TopicsOut = serde_json::from_str(strip_fences(raw))
        .map_err(|e| ClassificationError::Unparseable(e.to_string()))?;
    let topics = out
        .topics
        .iter()
        .map(|t| t.parse::<Topic>())
        .collect::<Result<BTreeSet<_>, _>>()?;
    if topics.is_empty() {
        return Err(ClassificationError::EmptyTopics);
    }
    Ok((topics, conf_or(out.confidence, 0.5), out.rationale.unwrap_or_default()))
}

/* ----------------------------
Classifier
---------------------------- */

enum StageError {
    Schema(ClassificationError),
    Service(ServiceError),
}

pub struct Classifier {
    rules: Arc<TaxonomyRules>,
    cfg: ClassifierConfig,
    /// Region weight and few-shot examples; swapped on promotion.
    live: LiveParams,
    judge: DynJudge,
    gate: ServiceGate,
}

impl Classifier {
    pub fn new(
        rules: Arc<TaxonomyRules>,
        cfg: ClassifierConfig,
        live: LiveParams,
        judge: DynJudge,
        gate: ServiceGate,
    ) -> Self {
        Self {
            rules,
            cfg,
            live,
            judge,
            gate,
        }
    }

    pub fn rules(&self) -> &TaxonomyRules {
        &self.rules
    }

    pub fn lexical(&self, article: &Article) -> LexicalClassification {
        let min_weight = self.live.read().region_min_weight;
        classify_lexical(&self.rules, article, min_weight)
    }

    fn few_shot_block(&self) -> String {
        let live = self.live.read();
        if live.few_shot.is_empty() {
            return String::new();
        }
        let mut s = String::from("\nExamples:\n");
        for ex in &live.few_shot {
            s.push_str(&format!(
                "- \"{}\" -> region={}, topics={}\n",
                ex.title,
                ex.region,
                ex.topics.join("|")
            ));
        }
        s
    }

    fn context(&self, article: &Article, expanded: bool) -> String {
        if expanded {
            article.body.clone()
        } else {
            article.body.chars().take(self.cfg.context_chars).collect()
        }
    }

    fn region_request(&self, article: &Article, lex: &RegionEvidence, expanded: bool, last_err: Option<&ClassificationError>) -> JudgmentRequest {
        let allowed: Vec<&str> = Region::ASSIGNABLE.iter().map(|r| r.as_str()).collect();
        let system = format!(
            "Assign the primary jurisdiction of a news article. Allowed regions: {}. \
             Jurisdiction names and legislation codes are the strongest evidence. \
             Reply with JSON {{\"region\": string, \"confidence\": number, \"rationale\": string}}.{}",
            allowed.join(", "),
            self.few_shot_block()
        );
        let mut user = format!(
            "Title: {}\nText: {}\nLexical evidence: {}",
            article.title,
            self.context(article, expanded),
            lex.matched.join(", ")
        );
        if let Some(e) = last_err {
            user.push_str(&format!("\nYour previous answer was rejected: {e}. Use only allowed values."));
        }
        let hint = json!({
            "region": lex.region.as_str(),
            "confidence": lex.confidence,
            "rationale": format!("lexical: {}", lex.matched.join(",")),
        });
        JudgmentRequest::new(JudgmentTask::Region, system, user).with_hint(hint.to_string())
    }

    fn topics_request(
        &self,
        article: &Article,
        region: Region,
        lex: &TopicEvidence,
        expanded: bool,
        last_err: Option<&ClassificationError>,
    ) -> JudgmentRequest {
        let allowed: Vec<&str> = Topic::ALL.iter().map(|t| t.as_str()).collect();
        let system = format!(
            "Assign one or more topics to a news article. Allowed topics: {}. \
             The article's jurisdiction has been resolved; interpret phrases as they are used there. \
             Reply with JSON {{\"topics\": [string], \"confidence\": number, \"rationale\": string}}.{}",
            allowed.join(", "),
            self.few_shot_block()
        );
        let mut user = format!(
            "Region: {}\nTitle: {}\nText: {}",
            region,
            article.title,
            self.context(article, expanded)
        );
        if let Some(e) = last_err {
            user.push_str(&format!("\nYour previous answer was rejected: {e}. Use only allowed values."));
        }
        let topics: Vec<&str> = lex.topics.iter().map(|t| t.as_str()).collect();
        let hint = json!({
            "topics": topics,
            "confidence": lex.confidence,
            "rationale": format!("lexical: {}", lex.matched.join(",")),
        });
        JudgmentRequest::new(JudgmentTask::Topics, system, user).with_hint(hint.to_string())
    }

    /// Call the model, validate, retry with expanded context on schema errors.
    async fn run_stage<T, B, P>(&self, build: B, parse: P) -> Result<T, StageError>
    where
        B: Fn(bool, Option<&ClassificationError>) -> JudgmentRequest,
        P: Fn(&str) -> Result<T, ClassificationError>,
    {
        let mut last_err: Option<ClassificationError> = None;
        for attempt in 0..=self.cfg.max_retries {
            let expanded = attempt > 0;
            let req = build(expanded, last_err.as_ref());
            let raw = self
                .gate
                .run("judge", self.judge.complete(&req))
                .await
                .map_err(StageError::Service)?;
            match parse(&raw) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    debug!(target: "classifier", attempt, error = %e, "schema-invalid model output");
                    last_err = Some(e);
                }
            }
        }
        Err(StageError::Schema(
            last_err.unwrap_or_else(|| ClassificationError::Unparseable("no attempt made".into())),
        ))
    }

    fn fallback(&self, article: &Article, err: &ClassificationError) -> Classification {
        counter!("triage_classification_fallback_total").increment(1);
        warn!(target: "classifier", id = %article.id, error = %err, "falling back to unclassified");
        Classification::unclassified(format!("model output invalid after retry: {err}"))
    }

    pub async fn classify(&self, article: &Article) -> Classification {
        let lex = self.lexical(article);
        if !self.cfg.use_model {
            return lex.to_classification();
        }

        // stage 1: region
        let (region, region_conf, region_why) = match self
            .run_stage(
                |expanded, e| self.region_request(article, &lex.region, expanded, e),
                parse_region_output,
            )
            .await
        {
            Ok(v) => v,
            Err(StageError::Schema(e)) => return self.fallback(article, &e),
            Err(StageError::Service(e)) => {
                debug!(target: "classifier", id = %article.id, error = %e, "model unavailable, keeping lexical labels");
                return lex.to_classification();
            }
        };

        // stage 2: topics under the resolved region
        let lex_topics = if region == lex.region.region {
            lex.topics.clone()
        } else {
            self.rules.topics(&article.full_text(), region)
        };
        let (topics, topic_conf, topic_why) = match self
            .run_stage(
                |expanded, e| self.topics_request(article, region, &lex_topics, expanded, e),
                parse_topics_output,
            )
            .await
        {
            Ok(v) => v,
            Err(StageError::Schema(e)) => return self.fallback(article, &e),
            Err(StageError::Service(e)) => {
                debug!(target: "classifier", id = %article.id, error = %e, "topic model unavailable, keeping lexical topics");
                (lex_topics.topics.clone(), lex_topics.confidence, "lexical topics".to_string())
            }
        };

        let rationale = format!("region: {region_why}; topics: {topic_why}");
        match Classification::new(region, topics, (region_conf + topic_conf) / 2.0, rationale) {
            Ok(c) => c,
            Err(e) => self.fallback(article, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::judge::MockJudge;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn article(title: &str, body: &str) -> Article {
        Article {
            id: "id1".into(),
            title: title.into(),
            body: body.into(),
            url: "https://x.test".into(),
            source: "X".into(),
            published_at: Utc::now(),
            language: "en".into(),
            summary: String::new(),
        }
    }

    fn classifier(judge: MockJudge, use_model: bool) -> Classifier {
        let cfg = ClassifierConfig {
            use_model,
            ..ClassifierConfig::default()
        };
        Classifier::new(
            Arc::new(TaxonomyRules::builtin().unwrap()),
            cfg,
            LiveParams::from_config(&PipelineConfig::default()),
            Arc::new(judge),
            ServiceGate::new(4, Duration::from_millis(200)),
        )
    }

    #[test]
    fn parsing_validates_against_closed_sets() {
        assert!(parse_region_output(r#"{"region":"apac"}"#).is_ok());
        assert!(matches!(
            parse_region_output(r#"{"region":"asia"}"#),
            Err(ClassificationError::InvalidLabel { .. })
        ));
        assert!(matches!(
            parse_region_output(r#"{"region":"unclassified"}"#),
            Err(ClassificationError::InvalidLabel { .. })
        ));
        assert!(matches!(parse_region_output("nope"), Err(ClassificationError::Unparseable(_))));
        assert_eq!(parse_topics_output(r#"{"topics":[]}"#), Err(ClassificationError::EmptyTopics));
        assert!(parse_topics_output(r#"{"topics":["regulatory","weather"]}"#).is_err());
        let (t, c, _) = parse_topics_output("```json\n{\"topics\":[\"litigation\"],\"confidence\":3}\n```").unwrap();
        assert!(t.contains(&Topic::Litigation));
        assert_eq!(c, 1.0);
    }

    #[tokio::test]
    async fn mock_model_agrees_with_lexical_rules() {
        let c = classifier(MockJudge::new(), true);
        let out = c
            .classify(&article("California expands Ban the Box", "New law for employers in California."))
            .await;
        assert_eq!(out.region, Region::NorthAmerica);
        assert!(out.has_regulatory_topic());
        assert!(out.is_valid());
    }

    #[tokio::test]
    async fn invalid_output_retries_once_then_succeeds() {
        let judge = MockJudge::scripted([
            r#"{"region":"mars"}"#,
            r#"{"region":"europe","confidence":0.8}"#,
            r#"{"topics":["data_privacy"],"confidence":0.7}"#,
        ]);
        let c = classifier(judge, true);
        let out = c.classify(&article("GDPR fine", "Regulator fines firm.")).await;
        assert_eq!(out.region, Region::Europe);
        assert_eq!(out.topics.iter().copied().collect::<Vec<_>>(), vec![Topic::DataPrivacy]);
    }

    #[tokio::test]
    async fn persistent_invalid_output_falls_back_to_unclassified() {
        let c = classifier(MockJudge::scripted([r#"{"region":"mars"}"#]), true);
        let out = c.classify(&article("Anything", "Body")).await;
        assert!(out.is_unclassified());
        assert!(out.topics.is_empty());
        assert_eq!(out.confidence, 0.0);
        assert!(out.is_valid());
    }

    #[tokio::test]
    async fn service_failure_keeps_lexical_answer() {
        let c = classifier(MockJudge::failing(), true);
        let out = c.classify(&article("Singapore updates PDPA guidance", "The PDPC said...")).await;
        assert_eq!(out.region, Region::Apac);
        assert!(!out.topics.is_empty());
    }

    #[test]
    fn promoted_region_weight_applies_without_rebuilding() {
        let live = LiveParams::from_config(&PipelineConfig::default());
        let c = Classifier::new(
            Arc::new(TaxonomyRules::builtin().unwrap()),
            ClassifierConfig::default(),
            live.clone(),
            Arc::new(MockJudge::new()),
            ServiceGate::new(1, Duration::from_millis(100)),
        );
        let a = article("Singapore updates PDPA guidance", "The PDPC said...");
        assert_eq!(c.lexical(&a).region.region, Region::Apac);

        let mut promoted = live.get();
        promoted.region_min_weight = 100.0;
        live.set(promoted);
        assert_eq!(c.lexical(&a).region.region, Region::Global);
    }

    #[tokio::test]
    async fn lexical_only_mode_never_calls_the_model() {
        let judge = Arc::new(MockJudge::new());
        let c = Classifier::new(
            Arc::new(TaxonomyRules::builtin().unwrap()),
            ClassifierConfig {
                use_model: false,
                ..ClassifierConfig::default()
            },
            LiveParams::from_config(&PipelineConfig::default()),
            judge.clone(),
            ServiceGate::new(1, Duration::from_millis(100)),
        );
        let _ = c.classify(&article("UK DBS checks", "Home Office guidance")).await;
        assert!(judge.calls().is_empty());
    }
}

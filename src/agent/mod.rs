// src/agent/mod.rs
//! Question answering over the store as an explicit state machine:
//!
//! ParseIntent → Retrieve → (Rerank, complex questions only) → Synthesize → Respond
//!
//! Every query gets a deadline (short for simple intent, longer for complex).
//! When it runs out the agent jumps to Respond with whatever it retrieved.
//! Retrieval runs at most `max_cycles` times, widening the date window once
//! when too few candidates come back.

pub mod intent;
pub mod synth;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::TaxonomyRules;
use crate::config::AgentConfig;
use crate::judge::embed::DynEmbedder;
use crate::judge::{DynJudge, JudgmentRequest, JudgmentTask, ServiceGate};
use crate::store::{Candidate, RankWeights, Store, StoreQuery};
pub use intent::{parse_intent, AskFilters, DateRange, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskStatus {
    Answered,
    InsufficientEvidence,
    /// Deadline hit; the answer covers only what was retrieved in time.
    Partial,
}

impl AskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AskStatus::Answered => "answered",
            AskStatus::InsufficientEvidence => "insufficient_evidence",
            AskStatus::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub cited_article_ids: Vec<String>,
    pub confidence: f32,
    pub status: AskStatus,
    /// States visited, in order.
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ParseIntent,
    Retrieve,
    Rerank,
    Synthesize,
    Respond,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::ParseIntent => "parse_intent",
            Stage::Retrieve => "retrieve",
            Stage::Rerank => "rerank",
            Stage::Synthesize => "synthesize",
            Stage::Respond => "respond",
        }
    }
}

/// Per-query working state carried between transitions.
struct Run {
    question: String,
    intent: Intent,
    candidates: Vec<Candidate>,
    cycles: u32,
    widened: bool,
    timed_out: bool,
    response: Option<AskResponse>,
    stages: Vec<String>,
}

pub struct QueryAgent {
    store: Arc<Store>,
    rules: Arc<TaxonomyRules>,
    embedder: DynEmbedder,
    judge: DynJudge,
    gate: ServiceGate,
    cfg: AgentConfig,
}

impl QueryAgent {
    pub fn new(
        store: Arc<Store>,
        rules: Arc<TaxonomyRules>,
        embedder: DynEmbedder,
        judge: DynJudge,
        gate: ServiceGate,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            store,
            rules,
            embedder,
            judge,
            gate,
            cfg,
        }
    }

    pub async fn ask(&self, question: &str, filters: Option<&AskFilters>) -> AskResponse {
        self.ask_at(question, filters, Utc::now()).await
    }

    /// Always returns a structured response.
    pub async fn ask_at(&self, question: &str, filters: Option<&AskFilters>, now: DateTime<Utc>) -> AskResponse {
        let started = Instant::now();
        let mut deadline = started + Duration::from_millis(self.cfg.simple_deadline_ms);
        let mut run = Run {
            question: question.trim().to_string(),
            intent: Intent::unfiltered(question),
            candidates: Vec::new(),
            cycles: 0,
            widened: false,
            timed_out: false,
            response: None,
            stages: Vec::new(),
        };

        let mut stage = Stage::ParseIntent;
        loop {
            run.stages.push(stage.as_str().to_string());
            debug!(target: "agent", stage = stage.as_str(), "enter");

            if stage != Stage::Respond && stage != Stage::ParseIntent && Instant::now() >= deadline {
                warn!(target: "agent", stage = stage.as_str(), "deadline reached");
                run.timed_out = true;
                stage = Stage::Respond;
                continue;
            }

            stage = match stage {
                Stage::ParseIntent => {
                    run.intent = parse_intent(
                        &run.question,
                        filters,
                        &self.rules,
                        now,
                        self.cfg.recent_days,
                        self.store.hot_horizon(),
                    );
                    if run.intent.complex {
                        deadline = started + Duration::from_millis(self.cfg.complex_deadline_ms);
                    }
                    debug!(target: "agent", complex = run.intent.complex, structured = run.intent.structured, region = ?run.intent.filter.region, "intent parsed");
                    Stage::Retrieve
                }
                Stage::Retrieve => {
                    self.retrieve(&mut run, now, deadline).await;
                    run.cycles += 1;
                    let want = self.cfg.default_k;
                    let can_widen = !run.widened
                        && run.intent.filter.published_after.is_some()
                        && run.cycles < self.cfg.max_cycles;
                    if run.candidates.len() < want && can_widen {
                        self.widen(&mut run, now);
                        Stage::Retrieve
                    } else if run.intent.complex && !run.candidates.is_empty() {
                        Stage::Rerank
                    } else {
                        Stage::Synthesize
                    }
                }
                Stage::Rerank => {
                    self.rerank(&mut run, deadline).await;
                    Stage::Synthesize
                }
                Stage::Synthesize => {
                    self.synthesize(&mut run, deadline).await;
                    Stage::Respond
                }
                Stage::Respond => break,
            };
        }

        let mut resp = run.response.take().unwrap_or_else(|| self.partial(&run));
        resp.stages = run.stages;
        counter!("agent_queries_total", "status" => resp.status.as_str()).increment(1);
        info!(
            target: "agent",
            status = resp.status.as_str(),
            cited = resp.cited_article_ids.len(),
            confidence = resp.confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query answered"
        );
        resp
    }

    fn remaining(deadline: Instant) -> Duration {
        deadline.saturating_duration_since(Instant::now())
    }

    async fn retrieve(&self, run: &mut Run, now: DateTime<Utc>, deadline: Instant) {
        let texts = vec![run.intent.semantic_query.clone()];
        let vector = if run.intent.semantic_query.is_empty() {
            None
        } else {
            match self
                .gate
                .run_with_deadline("embeddings", Self::remaining(deadline), self.embedder.embed(&texts))
                .await
            {
                Ok(mut v) => v.pop(),
                Err(e) => {
                    if e.is_timeout() {
                        run.timed_out = true;
                    }
                    debug!(target: "agent", error = %e, "query embedding failed, metadata ranking only");
                    None
                }
            }
        };
        let k = self.cfg.default_k * self.cfg.overfetch_factor;
        let q = StoreQuery {
            filter: run.intent.filter.clone(),
            vector,
            k,
            weights: RankWeights {
                vector: self.cfg.vector_weight,
                metadata: self.cfg.metadata_weight,
            },
        };
        run.candidates = self.store.query_at(&q, now);
        debug!(target: "agent", candidates = run.candidates.len(), cycle = run.cycles, "retrieved");
    }

    /// Double the look-back once.
    fn widen(&self, run: &mut Run, now: DateTime<Utc>) {
        if let Some(after) = run.intent.filter.published_after {
            let span = now - after;
            run.intent.filter.published_after = Some(now - span * 2);
            run.widened = true;
            debug!(target: "agent", days = (span * 2).num_days(), "date window widened");
        }
    }

    async fn rerank(&self, run: &mut Run, deadline: Instant) {
        let list: Vec<String> = run
            .candidates
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{i}] {} :: {}", c.article.title, c.article.summary))
            .collect();
        let req = JudgmentRequest::new(
            JudgmentTask::Rerank,
            "Score each candidate article for how well it answers the question. \
             Reply with JSON {\"scores\": [number between 0 and 1, one per candidate, in order]}.",
            format!("Question: {}\nCandidates:\n{}", run.question, list.join("\n")),
        )
        .with_hint(synth::rerank_hint(&run.question, &run.candidates));

        let scores = match self
            .gate
            .run_with_deadline("judge", Self::remaining(deadline), self.judge.complete(&req))
            .await
        {
            Ok(raw) => synth::parse_rerank_output(&raw, run.candidates.len()).ok(),
            Err(e) => {
                run.timed_out |= e.is_timeout();
                debug!(target: "agent", error = %e, "rerank unavailable, keeping retrieval order");
                None
            }
        };
        if let Some(scores) = scores {
            let mut paired: Vec<(f32, Candidate)> = scores.into_iter().zip(run.candidates.drain(..)).collect();
            paired.sort_by(|a, b| b.0.total_cmp(&a.0));
            run.candidates = paired
                .into_iter()
                .map(|(s, mut c)| {
                    c.score = s;
                    c
                })
                .collect();
        }
    }

    async fn synthesize(&self, run: &mut Run, deadline: Instant) {
        let bar = self.cfg.evidence_bar;
        let scored: Vec<(f32, &Candidate)> = run
            .candidates
            .iter()
            .map(|c| (synth::evidence(&run.question, c, run.intent.structured), c))
            .filter(|(e, _)| *e >= bar)
            .take(self.cfg.default_k)
            .collect();

        if scored.is_empty() {
            run.response = Some(AskResponse {
                answer: synth::INSUFFICIENT_EVIDENCE.to_string(),
                cited_article_ids: Vec::new(),
                confidence: 0.0,
                status: if run.timed_out { AskStatus::Partial } else { AskStatus::InsufficientEvidence },
                stages: Vec::new(),
            });
            return;
        }

        let used: Vec<&Candidate> = scored.iter().map(|(_, c)| *c).collect();
        let confidence = scored.iter().map(|(e, _)| *e).sum::<f32>() / scored.len() as f32;
        let allowed: BTreeSet<String> = used.iter().map(|c| c.article.id.clone()).collect();

        let context: Vec<String> = used
            .iter()
            .map(|c| format!("[{}] {} :: {}", c.article.id, c.article.title, c.article.summary))
            .collect();
        let req = JudgmentRequest::new(
            JudgmentTask::Answer,
            "Answer the question using only the articles provided. Cite the ids of the articles \
             you used. Reply with JSON {\"answer\": string, \"cited\": [id], \"confidence\": number}.",
            format!("Question: {}\nArticles:\n{}", run.question, context.join("\n")),
        )
        .with_hint(synth::answer_hint(&used, confidence));

        let (answer, cited, conf) = match self
            .gate
            .run_with_deadline("judge", Self::remaining(deadline), self.judge.complete(&req))
            .await
        {
            Ok(raw) => match synth::parse_answer_output(&raw, &allowed) {
                Ok(out) => {
                    let c = out.confidence.map(|m| m.min(confidence)).unwrap_or(confidence);
                    (out.answer, out.cited, c)
                }
                Err(e) => {
                    debug!(target: "agent", error = %e, "answer unusable, using extractive answer");
                    (synth::extractive_answer(&used), allowed.iter().cloned().collect(), confidence)
                }
            },
            Err(e) => {
                run.timed_out |= e.is_timeout();
                debug!(target: "agent", error = %e, "answer model unavailable, using extractive answer");
                (synth::extractive_answer(&used), allowed.iter().cloned().collect(), confidence)
            }
        };

        // keep citations in evidence order
        let cited_set: BTreeSet<String> = cited.into_iter().collect();
        let cited_article_ids: Vec<String> = used
            .iter()
            .map(|c| c.article.id.clone())
            .filter(|id| cited_set.contains(id))
            .collect();

        let status = if run.timed_out { AskStatus::Partial } else { AskStatus::Answered };
        let confidence = if run.timed_out { conf * 0.5 } else { conf };
        run.response = Some(AskResponse {
            answer,
            cited_article_ids,
            confidence: confidence.clamp(0.0, 1.0),
            status,
            stages: Vec::new(),
        });
    }

    /// Deadline hit before synthesis: answer from what was retrieved.
    fn partial(&self, run: &Run) -> AskResponse {
        let used: Vec<&Candidate> = run
            .candidates
            .iter()
            .filter(|c| synth::evidence(&run.question, c, run.intent.structured) >= self.cfg.evidence_bar)
            .take(self.cfg.default_k)
            .collect();
        if used.is_empty() {
            return AskResponse {
                answer: synth::INSUFFICIENT_EVIDENCE.to_string(),
                cited_article_ids: Vec::new(),
                confidence: 0.0,
                status: AskStatus::Partial,
                stages: Vec::new(),
            };
        }
        let conf = used
            .iter()
            .map(|c| synth::evidence(&run.question, c, run.intent.structured))
            .sum::<f32>()
            / used.len() as f32;
        AskResponse {
            answer: synth::extractive_answer(&used),
            cited_article_ids: used.iter().map(|c| c.article.id.clone()).collect(),
            confidence: (conf * 0.5).clamp(0.0, 1.0),
            status: AskStatus::Partial,
            stages: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::{HashingEmbedder, MockJudge};
    use crate::model::{Article, Classification, Region, RelevanceAssessment, Tier, Topic};

    fn agent(store: Arc<Store>, judge: MockJudge, cfg: AgentConfig) -> QueryAgent {
        QueryAgent::new(
            store,
            Arc::new(TaxonomyRules::builtin().unwrap()),
            Arc::new(HashingEmbedder::default()),
            Arc::new(judge),
            ServiceGate::new(4, Duration::from_secs(5)),
            cfg,
        )
    }

    fn seed(store: &Store, id: &str, region: Region, days_ago: i64) {
        let a = Article {
            id: id.into(),
            title: format!("Regulator issues screening guidance {id}"),
            body: "Body".into(),
            url: format!("https://x.test/{id}"),
            source: "S".into(),
            published_at: Utc::now() - chrono::Duration::days(days_ago),
            language: "en".into(),
            summary: "Regulator issues screening guidance".into(),
        };
        let c = Classification::new(region, [Topic::Regulatory].into_iter().collect(), 0.8, "t").unwrap();
        let r = RelevanceAssessment {
            lexical_score: 0.8,
            semantic_score: 0.6,
            model_score: Some(0.8),
            composite_score: 0.75,
            tier: Tier::Shortlist,
        };
        let v = HashingEmbedder::default().embed_one(&a.embedding_text());
        store.put(a, c, r, Some(v)).unwrap();
    }

    #[tokio::test]
    async fn empty_store_reports_insufficient_evidence() {
        let a = agent(Arc::new(Store::in_memory(180)), MockJudge::new(), AgentConfig::default());
        let r = a.ask("recent APAC regulation changes", None).await;
        assert_eq!(r.status, AskStatus::InsufficientEvidence);
        assert_eq!(r.confidence, 0.0);
        assert!(r.cited_article_ids.is_empty());
    }

    #[tokio::test]
    async fn simple_question_skips_rerank() {
        let store = Arc::new(Store::in_memory(180));
        seed(&store, "a1", Region::Apac, 2);
        let a = agent(store, MockJudge::new(), AgentConfig::default());
        let r = a.ask("recent APAC regulation changes", None).await;
        assert_eq!(r.status, AskStatus::Answered);
        assert_eq!(r.cited_article_ids, vec!["a1".to_string()]);
        assert!(!r.stages.iter().any(|s| s == "rerank"));
        assert_eq!(r.stages.first().map(String::as_str), Some("parse_intent"));
        assert_eq!(r.stages.last().map(String::as_str), Some("respond"));
    }

    #[tokio::test]
    async fn window_widens_once_for_sparse_results() {
        let store = Arc::new(Store::in_memory(180));
        seed(&store, "old", Region::Apac, 45);
        let a = agent(store, MockJudge::new(), AgentConfig::default());
        let r = a.ask("recent APAC regulation changes", None).await;
        assert_eq!(r.cited_article_ids, vec!["old".to_string()]);
        assert_eq!(r.stages.iter().filter(|s| *s == "retrieve").count(), 2);
    }

    #[tokio::test]
    async fn complex_question_reranks() {
        let store = Arc::new(Store::in_memory(180));
        seed(&store, "a1", Region::Apac, 1);
        let a = agent(store, MockJudge::new(), AgentConfig::default());
        let r = a.ask("What is the impact of APAC regulation trends?", None).await;
        assert!(r.stages.iter().any(|s| s == "rerank"));
        assert_eq!(r.status, AskStatus::Answered);
    }

    #[tokio::test]
    async fn slow_model_yields_partial_answer() {
        let store = Arc::new(Store::in_memory(180));
        seed(&store, "a1", Region::Apac, 1);
        let cfg = AgentConfig {
            simple_deadline_ms: 50,
            ..AgentConfig::default()
        };
        let a = agent(store, MockJudge::new().with_delay(Duration::from_millis(500)), cfg);
        let r = a.ask("recent APAC regulation changes", None).await;
        assert_eq!(r.status, AskStatus::Partial);
        assert_eq!(r.cited_article_ids, vec!["a1".to_string()]);
        assert!(r.confidence > 0.0 && r.confidence < 1.0);
    }
}

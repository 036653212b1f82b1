// src/agent/synth.rs
//! Rerank and synthesis helpers: evidence scoring, model output validation
//! and the extractive answer used as hint and fallback.

use std::collections::{BTreeSet, HashSet};

use serde::Deserialize;
use serde_json::json;

use crate::error::ServiceError;
use crate::judge::embed::content_terms;
use crate::judge::strip_fences;
use crate::model::clamp01;
use crate::store::Candidate;

pub const INSUFFICIENT_EVIDENCE: &str =
    "Insufficient evidence: no stored article is relevant enough to answer this question.";

/// Share of query terms present in the candidate's title + summary.
pub fn term_overlap(query: &str, c: &Candidate) -> f32 {
    let q: HashSet<String> = content_terms(query).into_iter().collect();
    if q.is_empty() {
        return 0.0;
    }
    let d: HashSet<String> = content_terms(&format!("{} {}", c.article.title, c.article.summary))
        .into_iter()
        .collect();
    q.intersection(&d).count() as f32 / q.len() as f32
}

/// How well a candidate supports an answer, in [0, 1].
///
/// Geometric mean of the match to the question and the stored metadata score.
/// Passing a structured filter taken from the question counts as a full match.
pub fn evidence(query: &str, c: &Candidate, structured: bool) -> f32 {
    let query_match = if structured {
        1.0
    } else {
        c.vector_score.max(term_overlap(query, c))
    };
    clamp01((clamp01(query_match) * clamp01(c.metadata_score)).sqrt())
}

/// Local rerank score: retrieval score blended with lexical overlap.
pub fn local_rerank_score(query: &str, c: &Candidate) -> f32 {
    clamp01(0.5 * c.score + 0.5 * term_overlap(query, c))
}

#[derive(Deserialize)]
struct RerankOut {
    scores: Vec<f32>,
}

/// `{"scores": [...]}` with exactly one finite score per candidate.
pub fn parse_rerank_output(raw: &str, n: usize) -> Result<Vec<f32>, ServiceError> {
    let out: RerankOut = serde_json::from_str(strip_fences(raw))
        .map_err(|e| ServiceError::BadResponse(format!("rerank: {e}")))?;
    if out.scores.len() != n || out.scores.iter().any(|s| !s.is_finite()) {
        return Err(ServiceError::BadResponse(format!(
            "rerank: expected {n} scores, got {}",
            out.scores.len()
        )));
    }
    Ok(out.scores.into_iter().map(clamp01).collect())
}

#[derive(Debug, Deserialize)]
pub struct AnswerOut {
    pub answer: String,
    #[serde(default)]
    pub cited: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Parse an answer and keep only citations of candidates actually offered.
pub fn parse_answer_output(raw: &str, allowed: &BTreeSet<String>) -> Result<AnswerOut, ServiceError> {
    let mut out: AnswerOut = serde_json::from_str(strip_fences(raw))
        .map_err(|e| ServiceError::BadResponse(format!("answer: {e}")))?;
    let mut seen = BTreeSet::new();
    out.cited.retain(|id| allowed.contains(id) && seen.insert(id.clone()));
    if out.answer.trim().is_empty() || out.cited.is_empty() {
        return Err(ServiceError::BadResponse("answer: empty or uncited".into()));
    }
    Ok(out)
}

/// One line per used candidate, with its id as the citation.
pub fn extractive_answer(used: &[&Candidate]) -> String {
    let mut s = format!("{} relevant article(s):", used.len());
    for c in used {
        let region = c
            .classification
            .as_ref()
            .map(|cl| cl.region.as_str())
            .unwrap_or("unknown");
        s.push_str(&format!(
            "\n- {} ({}, {}) [{}]",
            c.article.title,
            region,
            c.article.published_at.format("%Y-%m-%d"),
            c.article.id
        ));
    }
    s
}

pub fn answer_hint(used: &[&Candidate], confidence: f32) -> String {
    let ids: Vec<&str> = used.iter().map(|c| c.article.id.as_str()).collect();
    json!({
        "answer": extractive_answer(used),
        "cited": ids,
        "confidence": confidence,
    })
    .to_string()
}

pub fn rerank_hint(query: &str, cands: &[Candidate]) -> String {
    let scores: Vec<f32> = cands.iter().map(|c| local_rerank_score(query, c)).collect();
    json!({ "scores": scores }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rerank_output_must_match_candidate_count() {
        assert_eq!(parse_rerank_output(r#"{"scores":[0.2,1.5]}"#, 2).unwrap(), vec![0.2, 1.0]);
        assert!(parse_rerank_output(r#"{"scores":[0.2]}"#, 2).is_err());
    }

    #[test]
    fn fabricated_citations_are_dropped() {
        let allowed: BTreeSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
        let out = parse_answer_output(r#"{"answer":"x","cited":["a","zzz","a"]}"#, &allowed).unwrap();
        assert_eq!(out.cited, vec!["a".to_string()]);
        assert!(parse_answer_output(r#"{"answer":"x","cited":["zzz"]}"#, &allowed).is_err());
    }
}

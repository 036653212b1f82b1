// src/model.rs
//! Core records that flow through the pipeline: articles, classifications,
//! relevance assessments, duplicate clusters and training examples.
//!
//! Region and topic are closed enumerations. Anything outside them is rejected
//! at the parsing boundary with a typed `ClassificationError`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClassificationError;

/// Normalized, immutable article. `id` is the content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    /// ISO 639-1 code, or `und` when undetermined.
    pub language: String,
    /// Lead sentences of the body; used for shortlist output and embeddings.
    pub summary: String,
}

impl Article {
    /// Text fed to the embedding service.
    pub fn embedding_text(&self) -> String {
        format!("{}. {}", self.title, self.summary)
    }

    /// Text fed to the lexical matchers.
    pub fn full_text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
}

/* ----------------------------
Closed taxonomy
---------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    NorthAmerica,
    LatinAmerica,
    Europe,
    Uk,
    MiddleEastAfrica,
    Apac,
    Global,
    /// Fallback only: assigned when model output stays invalid after the retry.
    Unclassified,
}

impl Region {
    /// Regions a classifier may legitimately assign.
    pub const ASSIGNABLE: [Region; 7] = [
        Region::NorthAmerica,
        Region::LatinAmerica,
        Region::Europe,
        Region::Uk,
        Region::MiddleEastAfrica,
        Region::Apac,
        Region::Global,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::NorthAmerica => "north_america",
            Region::LatinAmerica => "latin_america",
            Region::Europe => "europe",
            Region::Uk => "uk",
            Region::MiddleEastAfrica => "middle_east_africa",
            Region::Apac => "apac",
            Region::Global => "global",
            Region::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = ClassificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Region::ASSIGNABLE
            .iter()
            .chain(std::iter::once(&Region::Unclassified))
            .find(|r| r.as_str() == key)
            .copied()
            .ok_or_else(|| ClassificationError::InvalidLabel {
                kind: "region",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Regulatory,
    Legislation,
    Enforcement,
    Litigation,
    CriminalRecords,
    CreditChecks,
    DrugTesting,
    RightToWork,
    DataPrivacy,
    IndustryNews,
}

impl Topic {
    pub const ALL: [Topic; 10] = [
        Topic::Regulatory,
        Topic::Legislation,
        Topic::Enforcement,
        Topic::Litigation,
        Topic::CriminalRecords,
        Topic::CreditChecks,
        Topic::DrugTesting,
        Topic::RightToWork,
        Topic::DataPrivacy,
        Topic::IndustryNews,
    ];

    /// The regulatory category: rule-making, statutes and their enforcement.
    pub const REGULATORY: [Topic; 3] = [Topic::Regulatory, Topic::Legislation, Topic::Enforcement];

    pub fn is_regulatory(&self) -> bool {
        Self::REGULATORY.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Regulatory => "regulatory",
            Topic::Legislation => "legislation",
            Topic::Enforcement => "enforcement",
            Topic::Litigation => "litigation",
            Topic::CriminalRecords => "criminal_records",
            Topic::CreditChecks => "credit_checks",
            Topic::DrugTesting => "drug_testing",
            Topic::RightToWork => "right_to_work",
            Topic::DataPrivacy => "data_privacy",
            Topic::IndustryNews => "industry_news",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = ClassificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Topic::ALL
            .iter()
            .find(|t| t.as_str() == key)
            .copied()
            .ok_or_else(|| ClassificationError::InvalidLabel {
                kind: "topic",
                value: s.to_string(),
            })
    }
}

/* ----------------------------
Derived records
---------------------------- */

/// Region + topics assigned to one article. Re-classification produces a new
/// record with a bumped `version`; existing records are never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub region: Region,
    pub topics: BTreeSet<Topic>,
    pub confidence: f32,
    pub rationale: String,
    #[serde(default = "first_version")]
    pub version: u32,
}

fn first_version() -> u32 {
    1
}

impl Classification {
    /// Validated constructor: region must be assignable, topics non-empty.
    pub fn new(
        region: Region,
        topics: BTreeSet<Topic>,
        confidence: f32,
        rationale: impl Into<String>,
    ) -> Result<Self, ClassificationError> {
        if region == Region::Unclassified {
            return Err(ClassificationError::InvalidLabel {
                kind: "region",
                value: region.to_string(),
            });
        }
        if topics.is_empty() {
            return Err(ClassificationError::EmptyTopics);
        }
        Ok(Self {
            region,
            topics,
            confidence: clamp01(confidence),
            rationale: rationale.into(),
            version: 1,
        })
    }

    /// The fallback record used after a failed retry.
    pub fn unclassified(rationale: impl Into<String>) -> Self {
        Self {
            region: Region::Unclassified,
            topics: BTreeSet::new(),
            confidence: 0.0,
            rationale: rationale.into(),
            version: 1,
        }
    }

    pub fn is_unclassified(&self) -> bool {
        self.region == Region::Unclassified
    }

    /// Either a proper classification or the exact fallback sentinel.
    pub fn is_valid(&self) -> bool {
        if self.is_unclassified() {
            return self.topics.is_empty() && self.confidence == 0.0;
        }
        !self.topics.is_empty() && (0.0..=1.0).contains(&self.confidence)
    }

    pub fn has_regulatory_topic(&self) -> bool {
        self.topics.iter().any(Topic::is_regulatory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Shortlist,
    ReviewQueue,
    Discard,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Shortlist, Tier::ReviewQueue, Tier::Discard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Shortlist => "shortlist",
            Tier::ReviewQueue => "review_queue",
            Tier::Discard => "discard",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the scorer. `model_score` is `None` when the judgment call was
/// skipped by the cheap-signal short-circuit or timed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceAssessment {
    pub lexical_score: f32,
    pub semantic_score: f32,
    pub model_score: Option<f32>,
    pub composite_score: f32,
    pub tier: Tier,
}

/// Articles judged equivalent. The canonical id is always a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCluster {
    pub canonical_id: String,
    pub member_ids: BTreeSet<String>,
    /// Similarity of each member to the canonical article (canonical = 1.0).
    pub similarity_scores: BTreeMap<String, f32>,
}

impl DuplicateCluster {
    pub fn new(canonical_id: impl Into<String>) -> Self {
        let canonical_id = canonical_id.into();
        let mut member_ids = BTreeSet::new();
        member_ids.insert(canonical_id.clone());
        let mut similarity_scores = BTreeMap::new();
        similarity_scores.insert(canonical_id.clone(), 1.0);
        Self {
            canonical_id,
            member_ids,
            similarity_scores,
        }
    }

    /// Append a member. Members are never removed.
    pub fn add_member(&mut self, id: impl Into<String>, similarity: f32) {
        let id = id.into();
        self.similarity_scores.insert(id.clone(), clamp01(similarity));
        self.member_ids.insert(id);
    }
}

/// Signals captured from the scorer at labeling time so the optimizer can
/// re-weight without calling external services again.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub lexical: f32,
    pub semantic: f32,
    pub model: Option<f32>,
    /// Source acceptance rate the reputation prior saw.
    #[serde(default)]
    pub source_acceptance: Option<f32>,
}

impl From<&RelevanceAssessment> for SignalSnapshot {
    fn from(a: &RelevanceAssessment) -> Self {
        Self {
            lexical: a.lexical_score,
            semantic: a.semantic_score,
            model: a.model_score,
            source_acceptance: None,
        }
    }
}

/// Human-labeled ground truth for one article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub article: Article,
    pub classification: Classification,
    pub relevance: Tier,
    #[serde(default)]
    pub signals: Option<SignalSnapshot>,
    pub labeled_at: DateTime<Utc>,
}

/// One row of the daily shortlist artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortlistEntry {
    pub article_id: String,
    pub title: String,
    pub url: String,
    pub region: Region,
    pub topics: BTreeSet<Topic>,
    pub composite_score: f32,
    pub summary: String,
}

pub(crate) fn clamp01(x: f32) -> f32 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

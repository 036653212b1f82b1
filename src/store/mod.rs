// src/store/mod.rs
//! Durable article store: metadata + vector index over hot and cold partitions.
//!
//! Writers are serialized behind the journal lock: each commit appends the
//! `StoreBatch` to the write-ahead journal and only then applies it in place.
//! A failed append leaves the visible state untouched, so a batch is either
//! fully committed or not at all. Readers share a read lock.

pub mod persist;
pub mod query;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::dedup::Demotion;
use crate::error::{StoreError, StoreWriteConflict};
use crate::model::{Article, Classification, DuplicateCluster, RelevanceAssessment, Region, ShortlistEntry, Tier};
use crate::prefilter::PrefilterOutcome;
use crate::reputation::{ReputationTable, SourceReputation};
use persist::{Journal, JournalEntry, JournalOp};
pub use query::{Candidate, RankWeights, StoreFilter, StoreQuery, DEFAULT_TIERS};

/// Pre-filter verdict kept with a soft-deleted article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub confidence: f32,
    pub lexical_score: f32,
    pub model_score: f32,
    pub reasons: Vec<String>,
    pub rejected_at: DateTime<Utc>,
}

impl Rejection {
    pub fn from_outcome(out: &PrefilterOutcome, at: DateTime<Utc>) -> Self {
        Self {
            confidence: out.confidence,
            lexical_score: out.lexical_score,
            model_score: out.model_score,
            reasons: out.reasons.clone(),
            rejected_at: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArticle {
    pub article: Article,
    /// Versioned history; the last entry is current.
    #[serde(default)]
    pub classifications: Vec<Classification>,
    #[serde(default)]
    pub assessment: Option<RelevanceAssessment>,
    #[serde(default)]
    pub duplicate_of: Option<String>,
    /// Set for pre-filter rejects (soft delete).
    #[serde(default)]
    pub rejection: Option<Rejection>,
    /// Embedding of title + summary.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub stored_at: DateTime<Utc>,
}

impl StoredArticle {
    fn new(article: Article, at: DateTime<Utc>) -> Self {
        Self {
            article,
            classifications: Vec::new(),
            assessment: None,
            duplicate_of: None,
            rejection: None,
            embedding: None,
            stored_at: at,
        }
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.classifications.last()
    }

    pub fn tier(&self) -> Option<Tier> {
        self.assessment.as_ref().map(|a| a.tier)
    }

    pub fn is_canonical(&self) -> bool {
        self.duplicate_of.is_none()
    }
}

/* ----------------------------
Batches
---------------------------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoreRecord {
    Scored {
        article: Article,
        classification: Classification,
        assessment: RelevanceAssessment,
        embedding: Option<Vec<f32>>,
    },
    Duplicate {
        article: Article,
        canonical_id: String,
    },
    Rejected {
        article: Article,
        rejection: Rejection,
    },
}

/// Everything one pipeline batch wants to write, applied atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreBatch {
    records: Vec<StoreRecord>,
    clusters: Vec<DuplicateCluster>,
    demotions: Vec<Demotion>,
}

impl StoreBatch {
    pub fn put(
        &mut self,
        article: Article,
        classification: Classification,
        assessment: RelevanceAssessment,
        embedding: Option<Vec<f32>>,
    ) {
        self.records.push(StoreRecord::Scored {
            article,
            classification,
            assessment,
            embedding,
        });
    }

    pub fn put_duplicate(&mut self, article: Article, canonical_id: impl Into<String>) {
        self.records.push(StoreRecord::Duplicate {
            article,
            canonical_id: canonical_id.into(),
        });
    }

    pub fn put_rejected(&mut self, article: Article, rejection: Rejection) {
        self.records.push(StoreRecord::Rejected { article, rejection });
    }

    pub fn cluster(&mut self, cluster: DuplicateCluster) {
        self.clusters.push(cluster);
    }

    pub fn demote(&mut self, d: Demotion) {
        self.demotions.push(d);
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.clusters.len() + self.demotions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: usize,
}

/* ----------------------------
State + secondary indexes
---------------------------- */

#[derive(Debug, Clone, Default)]
struct Indexes {
    by_region: HashMap<Region, BTreeSet<String>>,
    by_tier: HashMap<Tier, BTreeSet<String>>,
    by_date: BTreeSet<(DateTime<Utc>, String)>,
}

impl Indexes {
    fn add(&mut self, s: &StoredArticle) {
        let id = &s.article.id;
        if let Some(c) = s.classification() {
            self.by_region.entry(c.region).or_default().insert(id.clone());
        }
        if let Some(t) = s.tier() {
            self.by_tier.entry(t).or_default().insert(id.clone());
        }
        self.by_date.insert((s.article.published_at, id.clone()));
    }

    fn remove(&mut self, s: &StoredArticle) {
        let id = &s.article.id;
        if let Some(c) = s.classification() {
            if let Some(set) = self.by_region.get_mut(&c.region) {
                set.remove(id);
            }
        }
        if let Some(t) = s.tier() {
            if let Some(set) = self.by_tier.get_mut(&t) {
                set.remove(id);
            }
        }
        self.by_date.remove(&(s.article.published_at, id.clone()));
    }

    /// Smallest id set implied by the indexed constraints.
    fn candidates(&self, f: &StoreFilter) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = match f.region {
            Some(r) => self.by_region.get(&r).cloned().unwrap_or_default(),
            None => f
                .tiers()
                .iter()
                .filter_map(|t| self.by_tier.get(t))
                .flatten()
                .cloned()
                .collect(),
        };
        if f.published_after.is_some() || f.published_before.is_some() {
            let lo = f.published_after.unwrap_or(DateTime::<Utc>::MIN_UTC);
            let in_range: BTreeSet<String> = self
                .by_date
                .range((lo, String::new())..)
                .take_while(|(t, _)| f.published_before.map_or(true, |b| *t < b))
                .map(|(_, id)| id.clone())
                .collect();
            ids = ids.intersection(&in_range).cloned().collect();
        }
        ids
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    hot: BTreeMap<String, StoredArticle>,
    cold: BTreeMap<String, StoredArticle>,
    clusters: BTreeMap<String, DuplicateCluster>,
    reputation: ReputationTable,
    /// Last journal entry folded into this state.
    #[serde(default)]
    seq: u64,
    #[serde(skip)]
    index: Indexes,
}

impl StoreState {
    pub(crate) fn rebuild_indexes(&mut self) {
        let mut index = Indexes::default();
        for s in self.hot.values().chain(self.cold.values()) {
            index.add(s);
        }
        self.index = index;
    }

    fn get(&self, id: &str) -> Option<&StoredArticle> {
        self.hot.get(id).or_else(|| self.cold.get(id))
    }

    fn take(&mut self, id: &str) -> Option<(StoredArticle, bool)> {
        if let Some(s) = self.hot.remove(id) {
            self.index.remove(&s);
            return Some((s, false));
        }
        let s = self.cold.remove(id)?;
        self.index.remove(&s);
        Some((s, true))
    }

    fn insert(&mut self, s: StoredArticle, cold: bool) {
        self.index.add(&s);
        let id = s.article.id.clone();
        if cold {
            self.cold.insert(id, s);
        } else {
            self.hot.insert(id, s);
        }
    }

    /// Replay path: apply one journal entry and advance the sequence number.
    pub(crate) fn apply_entry(&mut self, entry: JournalEntry) {
        match entry.op {
            JournalOp::Batch { batch, at } => self.apply(batch, at, &mut CommitSummary::default()),
            JournalOp::Archive { cutoff } => {
                self.archive_before(cutoff);
            }
        }
        self.seq = entry.seq;
    }

    fn archive_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let old: Vec<String> = self
            .hot
            .values()
            .filter(|a| a.article.published_at < cutoff)
            .map(|a| a.article.id.clone())
            .collect();
        for id in &old {
            if let Some(a) = self.hot.remove(id) {
                self.cold.insert(id.clone(), a);
            }
        }
        old.len()
    }

    fn apply(&mut self, batch: StoreBatch, now: DateTime<Utc>, summary: &mut CommitSummary) {
        for rec in batch.records {
            match rec {
                StoreRecord::Scored {
                    article,
                    classification,
                    assessment,
                    embedding,
                } => self.apply_scored(article, classification, assessment, embedding, now, summary),
                StoreRecord::Duplicate { article, canonical_id } => {
                    match self.take(&article.id) {
                        Some((mut s, cold)) => {
                            note_conflict(&s.article, &article, summary);
                            if s.duplicate_of.as_deref() != Some(canonical_id.as_str()) {
                                s.duplicate_of = Some(canonical_id);
                                summary.updated += 1;
                            } else {
                                summary.unchanged += 1;
                            }
                            self.insert(s, cold);
                        }
                        None => {
                            let mut s = StoredArticle::new(article, now);
                            s.duplicate_of = Some(canonical_id);
                            self.insert(s, false);
                            summary.inserted += 1;
                        }
                    }
                }
                StoreRecord::Rejected { article, rejection } => {
                    // a scored article is never downgraded to a reject
                    if self.get(&article.id).is_some() {
                        summary.unchanged += 1;
                        continue;
                    }
                    let mut s = StoredArticle::new(article, now);
                    s.rejection = Some(rejection);
                    self.insert(s, false);
                    summary.inserted += 1;
                }
            }
        }

        for d in batch.demotions {
            if let Some((mut s, cold)) = self.take(&d.id) {
                s.duplicate_of = Some(d.new_canonical_id.clone());
                self.insert(s, cold);
                summary.updated += 1;
            }
            self.clusters.remove(&d.id);
        }
        for c in batch.clusters {
            self.clusters.insert(c.canonical_id.clone(), c);
        }
    }

    fn apply_scored(
        &mut self,
        article: Article,
        classification: Classification,
        assessment: RelevanceAssessment,
        embedding: Option<Vec<f32>>,
        now: DateTime<Utc>,
        summary: &mut CommitSummary,
    ) {
        let (mut s, cold, existed) = match self.take(&article.id) {
            Some((s, cold)) => (s, cold, true),
            None => (StoredArticle::new(article.clone(), now), false, false),
        };
        if existed {
            note_conflict(&s.article, &article, summary);
            s.article = article;
        }

        let first_decision = s.assessment.is_none();
        let changed_labels = match s.classification() {
            Some(prev) => !same_labels(prev, &classification),
            None => true,
        };
        if changed_labels {
            let version = s.classification().map(|c| c.version + 1).unwrap_or(1);
            s.classifications.push(Classification {
                version,
                ..classification
            });
        }
        let changed = changed_labels || s.assessment.as_ref() != Some(&assessment);
        if first_decision {
            self.reputation
                .record(&s.article.source, assessment.tier == Tier::Shortlist, s.article.published_at);
        }
        s.assessment = Some(assessment);
        if embedding.is_some() {
            s.embedding = embedding;
        }
        s.duplicate_of = None;
        s.rejection = None;

        match (existed, changed) {
            (false, _) => summary.inserted += 1,
            (true, true) => summary.updated += 1,
            (true, false) => summary.unchanged += 1,
        }
        self.insert(s, cold);
    }
}

fn same_labels(a: &Classification, b: &Classification) -> bool {
    a.region == b.region && a.topics == b.topics && a.confidence == b.confidence && a.rationale == b.rationale
}

/// Content is keyed by hash, so differing metadata under one id is an anomaly.
/// Last write wins.
fn note_conflict(old: &Article, new: &Article, summary: &mut CommitSummary) {
    if old != new {
        let conflict = StoreWriteConflict { id: new.id.clone() };
        warn!(target: "store", id = %new.id, anomaly = %conflict, "conflicting write, last writer wins");
        summary.conflicts += 1;
    }
}

/* ----------------------------
Store
---------------------------- */

pub struct Store {
    state: RwLock<StoreState>,
    /// `None` for in-memory stores. Held for the whole of every write.
    journal: Mutex<Option<Journal>>,
    hot_horizon: Duration,
}

impl Store {
    /// In-memory store (nothing persisted).
    pub fn in_memory(hot_horizon_days: i64) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            journal: Mutex::new(None),
            hot_horizon: Duration::days(hot_horizon_days.max(1)),
        }
    }

    /// Open the snapshot + journal under `data_dir`, or an in-memory store when unset.
    pub fn open(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let mut store = Self::in_memory(cfg.hot_horizon_days);
        if let Some(dir) = &cfg.data_dir {
            let (journal, state) = Journal::open(dir)?;
            store.state = RwLock::new(state);
            store.journal = Mutex::new(Some(journal));
        }
        Ok(store)
    }

    pub fn hot_horizon(&self) -> Duration {
        self.hot_horizon
    }

    /// Journal `op`, then apply it. Returns the number of archived articles
    /// for archive ops.
    fn write(&self, op: JournalOp, summary: &mut CommitSummary) -> Result<usize, StoreError> {
        let mut journal = self.journal.lock();
        let entry = JournalEntry {
            seq: self.state.read().seq + 1,
            op,
        };
        if let Some(j) = journal.as_mut() {
            j.append(&entry)?;
        }

        let mut state = self.state.write();
        let archived = match entry.op {
            JournalOp::Batch { batch, at } => {
                state.apply(batch, at, summary);
                0
            }
            JournalOp::Archive { cutoff } => state.archive_before(cutoff),
        };
        state.seq = entry.seq;
        let state = parking_lot::RwLockWriteGuard::downgrade(state);

        if let Some(j) = journal.as_mut().filter(|j| j.due()) {
            // the journal already holds the entry, so a failed compaction loses nothing
            if let Err(e) = j.compact(&state) {
                warn!(target: "store", error = %e, "journal compaction failed");
            }
        }
        Ok(archived)
    }

    /// Apply a batch atomically. On error nothing becomes visible.
    pub fn commit(&self, batch: StoreBatch) -> Result<CommitSummary, StoreError> {
        self.commit_at(batch, Utc::now())
    }

    pub fn commit_at(&self, batch: StoreBatch, now: DateTime<Utc>) -> Result<CommitSummary, StoreError> {
        let mut summary = CommitSummary::default();
        self.write(JournalOp::Batch { batch, at: now }, &mut summary)?;
        debug!(target: "store", inserted = summary.inserted, updated = summary.updated, unchanged = summary.unchanged, "batch committed");
        Ok(summary)
    }

    /// Idempotent on `article.id`.
    pub fn put(
        &self,
        article: Article,
        classification: Classification,
        assessment: RelevanceAssessment,
        embedding: Option<Vec<f32>>,
    ) -> Result<CommitSummary, StoreError> {
        let mut b = StoreBatch::default();
        b.put(article, classification, assessment, embedding);
        self.commit(b)
    }

    pub fn get(&self, id: &str) -> Option<StoredArticle> {
        self.state.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().get(id).is_some()
    }

    pub fn len(&self) -> usize {
        let s = self.state.read();
        s.hot.len() + s.cold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cold_len(&self) -> usize {
        self.state.read().cold.len()
    }

    pub fn query(&self, q: &StoreQuery) -> Vec<Candidate> {
        self.query_at(q, Utc::now())
    }

    pub fn query_at(&self, q: &StoreQuery, now: DateTime<Utc>) -> Vec<Candidate> {
        let s = self.state.read();
        let with_cold = q.filter.reaches_before(now - self.hot_horizon);
        let ids = s.index.candidates(&q.filter);
        let items = ids.iter().filter_map(|id| match s.hot.get(id) {
            Some(a) => Some(a),
            None if with_cold => s.cold.get(id),
            None => None,
        });
        query::rank(items, q, now)
    }

    /// Shortlist-tier canonical articles published in `[from, to)`, best first.
    pub fn shortlist(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<ShortlistEntry> {
        let s = self.state.read();
        let mut rows: Vec<(&StoredArticle, f32)> = s
            .hot
            .values()
            .chain(s.cold.values())
            .filter(|a| a.is_canonical() && a.rejection.is_none())
            .filter(|a| a.article.published_at >= from && a.article.published_at < to)
            .filter_map(|a| match &a.assessment {
                Some(asm) if asm.tier == Tier::Shortlist => Some((a, asm.composite_score)),
                _ => None,
            })
            .collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.article.id.cmp(&b.0.article.id)));
        rows.into_iter()
            .filter_map(|(a, score)| shortlist_entry(a, score))
            .collect()
    }

    /// Canonical, scored articles in the review queue or with low classification confidence.
    pub fn review_candidates(&self, low_confidence: f32) -> Vec<StoredArticle> {
        let s = self.state.read();
        s.hot
            .values()
            .filter(|a| a.is_canonical() && a.rejection.is_none())
            .filter(|a| {
                a.tier() == Some(Tier::ReviewQueue)
                    || a.classification().is_some_and(|c| c.confidence < low_confidence)
            })
            .cloned()
            .collect()
    }

    /// Soft-deleted pre-filter rejects, for audit.
    pub fn rejected(&self) -> Vec<StoredArticle> {
        let s = self.state.read();
        s.hot
            .values()
            .chain(s.cold.values())
            .filter(|a| a.rejection.is_some())
            .cloned()
            .collect()
    }

    /// Articles published since `since`, with their duplicate back-reference,
    /// for rebuilding the dedup window.
    pub fn dedup_seed(&self, since: DateTime<Utc>) -> Vec<(Article, Option<String>)> {
        let s = self.state.read();
        s.hot
            .values()
            .filter(|a| a.article.published_at >= since)
            .map(|a| (a.article.clone(), a.duplicate_of.clone()))
            .collect()
    }

    pub fn clusters(&self) -> Vec<DuplicateCluster> {
        self.state.read().clusters.values().cloned().collect()
    }

    pub fn cluster_of(&self, canonical_id: &str) -> Option<DuplicateCluster> {
        self.state.read().clusters.get(canonical_id).cloned()
    }

    pub fn reputation(&self) -> ReputationTable {
        self.state.read().reputation.clone()
    }

    pub fn source_reputation(&self, source: &str) -> Option<SourceReputation> {
        self.state.read().reputation.get(source).cloned()
    }

    /// Move articles older than the hot horizon into the cold partition.
    pub fn archive(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now - self.hot_horizon;
        let due = self.state.read().hot.values().any(|a| a.article.published_at < cutoff);
        if !due {
            return Ok(0);
        }
        let moved = self.write(JournalOp::Archive { cutoff }, &mut CommitSummary::default())?;
        info!(target: "store", moved, "archived to cold partition");
        Ok(moved)
    }
}

fn shortlist_entry(a: &StoredArticle, score: f32) -> Option<ShortlistEntry> {
    let c = a.classification()?;
    Some(ShortlistEntry {
        article_id: a.article.id.clone(),
        title: a.article.title.clone(),
        url: a.article.url.clone(),
        region: c.region,
        topics: c.topics.clone(),
        composite_score: score,
        summary: a.article.summary.clone(),
    })
}

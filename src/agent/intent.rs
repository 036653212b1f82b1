// src/agent/intent.rs
//! Question → semantic query + structured filters.
//!
//! Extraction never fails: when nothing usable comes out (or the evidence is
//! ambiguous) the whole question becomes the semantic query with no filters.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::classify::TaxonomyRules;
use crate::model::{Region, Topic};
use crate::store::StoreFilter;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Caller-supplied filters; each one present overrides the inferred value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AskFilters {
    pub region: Option<Region>,
    pub topics: Option<Vec<Topic>>,
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub semantic_query: String,
    pub filter: StoreFilter,
    /// Multi-part or analytical question: rerank and use the longer deadline.
    pub complex: bool,
    /// True when any structured filter came out of the question or the caller.
    pub structured: bool,
}

impl Intent {
    pub fn unfiltered(question: &str) -> Self {
        Self {
            semantic_query: question.trim().to_string(),
            filter: StoreFilter::default(),
            complex: false,
            structured: false,
        }
    }
}

static RE_REGULATORY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(regulat\w*|rules?|laws?|legislat\w*|legal|compliance|enforce\w*|bills?|statutes?|policy|policies)\b")
        .expect("valid regulatory intent regex")
});
static RE_LAST_N_DAYS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:last|past)\s+(\d{1,3})\s+days?\b").expect("valid day-range regex"));
static RE_WEEK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(last|past|this)\s+week\b").expect("valid week regex"));
static RE_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(last|past|this)\s+month\b").expect("valid month regex"));
static RE_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(last|past|this)\s+year\b").expect("valid year regex"));
static RE_TODAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(today|yesterday)\b").expect("valid today regex"));
static RE_RECENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(recent|recently|latest|lately|new|current)\b").expect("valid recency regex"));
static RE_COMPLEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(compare|comparison|versus|vs\.?|difference|differences|why|impact|implications?|trends?|summari[sz]e|across)\b")
        .expect("valid complexity regex")
});

/// Days of look-back implied by the question, if any.
fn date_window_days(q: &str, recent_days: i64) -> Option<i64> {
    if let Some(c) = RE_LAST_N_DAYS.captures(q) {
        if let Ok(n) = c[1].parse::<i64>() {
            return Some(n.max(1));
        }
    }
    if RE_TODAY.is_match(q) {
        return Some(2);
    }
    if RE_WEEK.is_match(q) {
        return Some(7);
    }
    if RE_MONTH.is_match(q) {
        return Some(31);
    }
    if RE_YEAR.is_match(q) {
        return Some(366);
    }
    if RE_RECENT.is_match(q) {
        return Some(recent_days.max(1));
    }
    None
}

/// Region only when one non-global region clearly leads.
fn infer_region(rules: &TaxonomyRules, q: &str) -> Option<Region> {
    let ev = rules.region(q, 1.0);
    if ev.region == Region::Global {
        return None;
    }
    let top = ev.scores.get(&ev.region).copied().unwrap_or(0.0);
    let tied = ev
        .scores
        .iter()
        .any(|(r, s)| *r != ev.region && *r != Region::Global && (*s - top).abs() < f32::EPSILON);
    if tied {
        None
    } else {
        Some(ev.region)
    }
}

fn infer_topics(rules: &TaxonomyRules, q: &str, region: Option<Region>) -> BTreeSet<Topic> {
    let mut out = BTreeSet::new();
    if RE_REGULATORY.is_match(q) {
        out.extend(Topic::REGULATORY);
    }
    let ev = rules.topics(q, region.unwrap_or(Region::Global));
    // the empty-evidence fallback label is not a real signal
    if !ev.matched.is_empty() {
        out.extend(ev.topics.iter().copied());
    }
    // a regulatory question should also match every regulatory label
    if out.iter().any(Topic::is_regulatory) {
        out.extend(Topic::REGULATORY);
    }
    out
}

pub fn parse_intent(
    question: &str,
    explicit: Option<&AskFilters>,
    rules: &TaxonomyRules,
    now: DateTime<Utc>,
    recent_days: i64,
    hot_horizon: Duration,
) -> Intent {
    let q = question.trim();
    let mut intent = Intent::unfiltered(q);
    if q.is_empty() && explicit.is_none() {
        return intent;
    }

    let region = infer_region(rules, q);
    let topics = infer_topics(rules, q, region);
    let days = date_window_days(q, recent_days);

    intent.filter.region = region;
    intent.filter.topics = topics;
    if let Some(d) = days {
        intent.filter.published_after = Some(now - Duration::days(d));
    }

    if let Some(f) = explicit {
        if f.region.is_some() {
            intent.filter.region = f.region;
        }
        if let Some(t) = &f.topics {
            intent.filter.topics = t.iter().copied().collect();
        }
        if let Some(r) = f.date_range {
            intent.filter.published_after = Some(r.from);
            intent.filter.published_before = Some(r.to);
        }
    }

    // anything reaching past the hot horizon has to search the archive too
    let hist_cutoff = now - hot_horizon;
    if intent.filter.published_after.is_some_and(|a| a < hist_cutoff) {
        intent.filter.include_historical = true;
    }

    intent.structured = intent.filter.region.is_some() || !intent.filter.topics.is_empty();
    let words = q.split_whitespace().count();
    intent.complex = RE_COMPLEX.is_match(q) || words > 14 || q.matches('?').count() > 1;
    intent
}

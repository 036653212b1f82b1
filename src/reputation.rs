// src/reputation.rs
//! Per-source acceptance history used as a soft prior by the scorer and as the
//! drift signal by the optimizer. The table lives in the store and changes only
//! through `ReputationTable::record`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smoothing factor of the recent acceptance rate (EWMA).
pub const RECENT_ALPHA: f32 = 0.2;

/// Lowercased, whitespace-collapsed source key ("  Reuters " == "reuters").
pub fn source_key(source: &str) -> String {
    source
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `(1 - w) * composite + w * acceptance`, clamped to [0, 1].
pub fn blend_prior(composite: f32, acceptance: f32, weight: f32) -> f32 {
    let w = weight.clamp(0.0, 1.0);
    ((1.0 - w) * composite + w * acceptance).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReputation {
    pub source: String,
    /// Shortlist decisions.
    pub accepted: u64,
    /// All scored articles.
    pub total: u64,
    /// Exponentially weighted recent acceptance rate.
    pub recent_rate: f32,
    pub updated_at: DateTime<Utc>,
}

impl SourceReputation {
    pub fn new(source: &str, at: DateTime<Utc>) -> Self {
        Self {
            source: source_key(source),
            accepted: 0,
            total: 0,
            recent_rate: 0.5,
            updated_at: at,
        }
    }

    /// Long-run acceptance rate with a Laplace prior (0.5 with no history).
    pub fn acceptance_rate(&self) -> f32 {
        (self.accepted as f32 + 1.0) / (self.total as f32 + 2.0)
    }

    /// Deviation of the recent rate from the long-run baseline, in [0, 1].
    pub fn drift(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.recent_rate - self.acceptance_rate()).abs().clamp(0.0, 1.0)
    }

    pub fn record(&mut self, accepted: bool, at: DateTime<Utc>) {
        self.total += 1;
        if accepted {
            self.accepted += 1;
        }
        let x = if accepted { 1.0 } else { 0.0 };
        self.recent_rate = (1.0 - RECENT_ALPHA) * self.recent_rate + RECENT_ALPHA * x;
        if at > self.updated_at {
            self.updated_at = at;
        }
    }

    /// Blend a composite score toward this source's acceptance rate.
    pub fn apply_prior(&self, composite: f32, weight: f32) -> f32 {
        blend_prior(composite, self.acceptance_rate(), weight)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReputationTable {
    sources: BTreeMap<String, SourceReputation>,
}

impl ReputationTable {
    pub fn get(&self, source: &str) -> Option<&SourceReputation> {
        self.sources.get(&source_key(source))
    }

    pub fn record(&mut self, source: &str, accepted: bool, at: DateTime<Utc>) {
        self.sources
            .entry(source_key(source))
            .or_insert_with(|| SourceReputation::new(source, at))
            .record(accepted, at);
    }

    /// Drift of `source`, zero when it has no history.
    pub fn drift(&self, source: &str) -> f32 {
        self.get(source).map(SourceReputation::drift).unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceReputation> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_normalized() {
        let mut t = ReputationTable::default();
        let now = Utc::now();
        t.record("  Reuters ", true, now);
        t.record("reuters", false, now);
        assert_eq!(t.len(), 1);
        let r = t.get("REUTERS").unwrap();
        assert_eq!((r.accepted, r.total), (1, 2));
        assert!((r.acceptance_rate() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn prior_pulls_toward_history() {
        let now = Utc::now();
        let mut r = SourceReputation::new("x", now);
        for _ in 0..8 {
            r.record(true, now);
        }
        assert!(r.apply_prior(0.5, 0.2) > 0.5);
        assert_eq!(r.apply_prior(0.5, 0.0), 0.5);
    }

    #[test]
    fn drift_reflects_recent_change() {
        let now = Utc::now();
        let mut r = SourceReputation::new("x", now);
        for _ in 0..20 {
            r.record(false, now);
        }
        let calm = r.drift();
        for _ in 0..5 {
            r.record(true, now);
        }
        assert!(r.drift() > calm);
        assert_eq!(SourceReputation::new("y", now).drift(), 0.0);
    }
}

// src/classify/rules.rs
//! Lexical region/topic rules compiled from TOML.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;

use crate::model::{Region, Topic};

pub const DEFAULT_TAXONOMY: &str = include_str!("../../config/taxonomy.toml");

#[derive(Debug, Clone, Deserialize)]
struct TaxonomyRoot {
    #[serde(default = "default_topic_min")]
    topic_min_score: f32,
    #[serde(default)]
    regions: Vec<RegionRuleCfg>,
    #[serde(default)]
    topics: Vec<TopicRuleCfg>,
}

fn default_topic_min() -> f32 {
    1.0
}
fn default_weight() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
struct RegionRuleCfg {
    id: String,
    region: String,
    #[serde(default = "default_weight")]
    weight: f32,
    pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TopicRuleCfg {
    id: String,
    topics: Vec<String>,
    #[serde(default = "default_weight")]
    weight: f32,
    #[serde(default)]
    regions: Vec<String>,
    #[serde(default)]
    except_regions: Vec<String>,
    pattern: String,
}

#[derive(Debug)]
struct RegionRule {
    id: String,
    region: Region,
    weight: f32,
    re: Regex,
}

#[derive(Debug)]
struct TopicRule {
    id: String,
    topics: Vec<Topic>,
    weight: f32,
    regions: Vec<Region>,
    except_regions: Vec<Region>,
    re: Regex,
}

impl TopicRule {
    fn applies_to(&self, region: Region) -> bool {
        (self.regions.is_empty() || self.regions.contains(&region))
            && !self.except_regions.contains(&region)
    }
}

/// Outcome of the lexical region stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionEvidence {
    pub region: Region,
    pub confidence: f32,
    pub scores: BTreeMap<Region, f32>,
    pub matched: Vec<String>,
}

/// Outcome of the lexical topic stage for a given region.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicEvidence {
    pub topics: BTreeSet<Topic>,
    pub confidence: f32,
    pub scores: BTreeMap<Topic, f32>,
    pub matched: Vec<String>,
}

#[derive(Debug)]
pub struct TaxonomyRules {
    topic_min_score: f32,
    regions: Vec<RegionRule>,
    topics: Vec<TopicRule>,
}

fn hits(re: &Regex, text: &str) -> usize {
    re.find_iter(text).count().min(3)
}

impl TaxonomyRules {
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(DEFAULT_TAXONOMY)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading taxonomy rules from {}", path.display()))?;
        Self::from_toml_str(&s)
    }

    /// Unknown region/topic names are configuration errors, not silent skips.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let root: TaxonomyRoot = toml::from_str(s)?;
        let regions = root
            .regions
            .into_iter()
            .map(|r| {
                let region: Region = r
                    .region
                    .parse()
                    .with_context(|| format!("region rule `{}`", r.id))?;
                let re = Regex::new(&r.pattern)
                    .with_context(|| format!("region rule `{}` regex", r.id))?;
                Ok(RegionRule {
                    id: r.id,
                    region,
                    weight: r.weight.max(0.0),
                    re,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let parse_regions = |id: &str, v: &[String]| -> anyhow::Result<Vec<Region>> {
            v.iter()
                .map(|s| s.parse::<Region>().with_context(|| format!("topic rule `{id}`")))
                .collect()
        };

        let topics = root
            .topics
            .into_iter()
            .map(|t| {
                let topics = t
                    .topics
                    .iter()
                    .map(|s| s.parse::<Topic>().with_context(|| format!("topic rule `{}`", t.id)))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                let regions = parse_regions(&t.id, &t.regions)?;
                let except_regions = parse_regions(&t.id, &t.except_regions)?;
                let re = Regex::new(&t.pattern)
                    .with_context(|| format!("topic rule `{}` regex", t.id))?;
                Ok(TopicRule {
                    id: t.id,
                    topics,
                    weight: t.weight.max(0.0),
                    regions,
                    except_regions,
                    re,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            topic_min_score: root.topic_min_score.max(0.0),
            regions,
            topics,
        })
    }

    /// Region stage: argmax of accumulated rule weight. Below `min_weight`
    /// the article is treated as `global`.
    pub fn region(&self, text: &str, min_weight: f32) -> RegionEvidence {
        let mut scores: BTreeMap<Region, f32> = BTreeMap::new();
        let mut matched = Vec::new();
        for r in &self.regions {
            let n = hits(&r.re, text);
            if n > 0 {
                *scores.entry(r.region).or_insert(0.0) += r.weight * n as f32;
                matched.push(r.id.clone());
            }
        }

        // BTreeMap order makes ties deterministic (enum declaration order)
        let mut best: Option<(Region, f32)> = None;
        for (&region, &s) in &scores {
            if region == Region::Global {
                continue;
            }
            if best.map_or(true, |(_, b)| s > b) {
                best = Some((region, s));
            }
        }
        let total: f32 = scores.values().sum();

        match best {
            Some((region, top)) if top >= min_weight && top > 0.0 => {
                let share = if total > 0.0 { top / total } else { 0.0 };
                // more evidence and less competition → higher confidence
                let strength = (top / (top + 2.0)).clamp(0.0, 1.0);
                let confidence = (0.5 * share + 0.5 * strength).clamp(0.0, 1.0);
                RegionEvidence {
                    region,
                    confidence,
                    scores,
                    matched,
                }
            }
            _ => {
                let g = scores.get(&Region::Global).copied().unwrap_or(0.0);
                RegionEvidence {
                    region: Region::Global,
                    confidence: if g > 0.0 { 0.6 } else { 0.4 },
                    scores,
                    matched,
                }
            }
        }
    }

    /// Topic stage, conditioned on the resolved region. Never empty.
    pub fn topics(&self, text: &str, region: Region) -> TopicEvidence {
        let mut scores: BTreeMap<Topic, f32> = BTreeMap::new();
        let mut matched = Vec::new();
        for rule in self.topics.iter().filter(|r| r.applies_to(region)) {
            let n = hits(&rule.re, text);
            if n == 0 {
                continue;
            }
            matched.push(rule.id.clone());
            for t in &rule.topics {
                *scores.entry(*t).or_insert(0.0) += rule.weight * n as f32;
            }
        }

        let topics: BTreeSet<Topic> = scores
            .iter()
            .filter(|(_, s)| **s >= self.topic_min_score)
            .map(|(t, _)| *t)
            .collect();

        if topics.is_empty() {
            return TopicEvidence {
                topics: [Topic::IndustryNews].into_iter().collect(),
                confidence: 0.3,
                scores,
                matched,
            };
        }
        let top = scores.values().copied().fold(0.0f32, f32::max);
        TopicEvidence {
            confidence: (top / (top + 2.0)).clamp(0.3, 0.95),
            topics,
            scores,
            matched,
        }
    }
}

// src/optimize/training.rs
//! Append-only JSONL log of labeled examples, deterministic train/validation
//! splits and the pointer to the deployed configuration.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::compile::CompiledParams;
use crate::model::{Classification, SignalSnapshot, Tier, TrainingExample};
use crate::reputation::SourceReputation;
use crate::store::persist::write_json_atomic;
use crate::store::StoredArticle;

/// Build a labeled example from a stored article and its human labels.
/// The scorer signals recorded at storage time travel with it, along with the
/// source's acceptance rate so validation can replay the reputation prior.
pub fn label(
    stored: &StoredArticle,
    reputation: Option<&SourceReputation>,
    truth: Classification,
    relevance: Tier,
    at: DateTime<Utc>,
) -> TrainingExample {
    let signals = stored.assessment.as_ref().map(|a| SignalSnapshot {
        source_acceptance: reputation.map(SourceReputation::acceptance_rate),
        ..SignalSnapshot::from(a)
    });
    TrainingExample {
        article: stored.article.clone(),
        classification: truth,
        relevance,
        signals,
        labeled_at: at,
    }
}

pub struct TrainingLog {
    path: PathBuf,
}

impl TrainingLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append examples, one JSON object per line. Existing lines are never rewritten.
    pub fn append(&self, examples: &[TrainingExample]) -> Result<usize> {
        if examples.is_empty() {
            return Ok(0);
        }
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening training log {}", self.path.display()))?;
        let mut buf = String::new();
        for ex in examples {
            buf.push_str(&serde_json::to_string(ex)?);
            buf.push('\n');
        }
        f.write_all(buf.as_bytes())?;
        f.sync_all()?;
        Ok(examples.len())
    }

    /// All examples in log order. A missing log is empty; bad lines are skipped.
    pub fn load(&self) -> Result<Vec<TrainingExample>> {
        let f = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let mut out = Vec::new();
        for (n, line) in BufReader::new(f).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TrainingExample>(&line) {
                Ok(ex) => out.push(ex),
                Err(e) => warn!(target: "optimize", line = n + 1, error = %e, "skipping bad training log line"),
            }
        }
        Ok(out)
    }
}

/// Train/validation partition of the log at a given length.
#[derive(Debug, Clone)]
pub struct Split {
    /// Number of log entries the split was built from.
    pub version: usize,
    pub train: Vec<TrainingExample>,
    pub validation: Vec<TrainingExample>,
}

fn bucket(id: &str) -> u32 {
    let d = Sha256::digest(id.as_bytes());
    u32::from_be_bytes([d[0], d[1], d[2], d[3]]) % 10_000
}

/// An article always lands on the same side of the split, so a validation
/// example never leaks into training as the log grows. Later labels for the
/// same article replace earlier ones.
pub fn split(examples: &[TrainingExample], validation_ratio: f32) -> Split {
    let cut = (validation_ratio.clamp(0.0, 1.0) * 10_000.0) as u32;
    let mut latest: BTreeMap<&str, &TrainingExample> = BTreeMap::new();
    for ex in examples {
        latest.insert(ex.article.id.as_str(), ex);
    }
    let (mut train, mut validation) = (Vec::new(), Vec::new());
    for (id, ex) in latest {
        if bucket(id) < cut {
            validation.push(ex.clone());
        } else {
            train.push(ex.clone());
        }
    }
    Split {
        version: examples.len(),
        train,
        validation,
    }
}

/// Currently deployed classifier/scorer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedPointer {
    pub version: u32,
    pub params: CompiledParams,
    pub validation_score: f32,
    /// Training log length at compile time.
    pub trained_on: usize,
    pub deployed_at: DateTime<Utc>,
}

impl DeployedPointer {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(s) => Ok(Some(
                serde_json::from_str(&s).with_context(|| format!("parsing {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        write_json_atomic(path, self).with_context(|| format!("writing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Article, Region, Topic};

    fn example(id: &str) -> TrainingExample {
        TrainingExample {
            article: Article {
                id: id.into(),
                title: "t".into(),
                body: "b".into(),
                url: "https://x.test".into(),
                source: "S".into(),
                published_at: Utc::now(),
                language: "en".into(),
                summary: String::new(),
            },
            classification: Classification::new(Region::Europe, [Topic::DataPrivacy].into_iter().collect(), 1.0, "")
                .unwrap(),
            relevance: Tier::Shortlist,
            signals: None,
            labeled_at: Utc::now(),
        }
    }

    #[test]
    fn log_appends_and_tolerates_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrainingLog::new(dir.path().join("nested/training.jsonl"));
        assert!(log.load().unwrap().is_empty());
        log.append(&[example("a"), example("b")]).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"{not json}\n")
            .unwrap();
        log.append(&[example("c")]).unwrap();
        let ids: Vec<String> = log.load().unwrap().into_iter().map(|e| e.article.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn split_is_stable_as_log_grows() {
        let first: Vec<_> = (0..40).map(|i| example(&format!("id{i}"))).collect();
        let s1 = split(&first, 0.25);
        let mut grown = first.clone();
        grown.extend((40..80).map(|i| example(&format!("id{i}"))));
        let s2 = split(&grown, 0.25);
        for ex in &s1.validation {
            assert!(s2.validation.iter().any(|v| v.article.id == ex.article.id));
        }
        assert_eq!(s2.train.len() + s2.validation.len(), 80);
        assert_eq!(s2.version, 80);
    }
}

// src/config/mod.rs
//! Pipeline configuration: one TOML document with a section per stage.
//!
//! Every field has a serde default so an empty document is valid. Thresholds
//! are clamped into `[0, 1]` after loading and may be overridden from env.

pub mod model;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub use model::{ModelConfig, ModelProvider};

pub const DEFAULT_CONFIG_PATH: &str = "config/triage.toml";
pub const ENV_CONFIG_PATH: &str = "TRIAGE_CONFIG_PATH";
pub const ENV_HIGH_THRESHOLD: &str = "TRIAGE_HIGH_THRESHOLD";
pub const ENV_LOW_THRESHOLD: &str = "TRIAGE_LOW_THRESHOLD";
pub const ENV_CONCURRENCY: &str = "TRIAGE_CONCURRENCY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
}

/* ----------------------------
Sections
---------------------------- */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dedup: DedupConfig,
    pub prefilter: PrefilterConfig,
    pub scoring: ScoringConfig,
    pub classifier: ClassifierConfig,
    pub store: StoreConfig,
    pub agent: AgentConfig,
    pub optimize: OptimizeConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub similarity_threshold: f32,
    pub retention_days: i64,
    /// Maximum canonical articles kept in the recent window.
    pub window_capacity: usize,
    /// Word n-gram size used for body shingles.
    pub shingle_size: usize,
    /// Share of the similarity taken from title edit distance.
    pub title_weight: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            retention_days: 30,
            window_capacity: 20_000,
            shingle_size: 2,
            title_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefilterConfig {
    /// Keyword rules file. Falls back to the built-in rule set when unset.
    pub rules_path: Option<PathBuf>,
    /// Overrides `[gate].threshold` from the rules file.
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub lexical_weight: f32,
    pub semantic_weight: f32,
    pub model_weight: f32,
    pub high_threshold: f32,
    pub low_threshold: f32,
    /// Both cheap signals below this bar skip the model judgment call.
    pub min_signal_bar: f32,
    /// Blend weight of the per-source acceptance rate (0 disables the prior).
    pub reputation_prior_weight: f32,
    /// Weighted keyword hits per 100 tokens that saturate the lexical signal.
    pub density_saturation: f32,
    pub exemplars: Vec<Exemplar>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.3,
            semantic_weight: 0.3,
            model_weight: 0.4,
            high_threshold: 0.6,
            low_threshold: 0.35,
            min_signal_bar: 0.15,
            reputation_prior_weight: 0.1,
            density_saturation: 6.0,
            exemplars: default_exemplars(),
        }
    }
}

/// An "ideal" article the semantic signal compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub title: String,
    pub text: String,
}

fn default_exemplars() -> Vec<Exemplar> {
    let ex = |title: &str, text: &str| Exemplar {
        title: title.to_string(),
        text: text.to_string(),
    };
    vec![
        ex(
            "State expands ban the box law for employers",
            "New legislation restricts when employers may ask about criminal history \
             and conviction records during hiring and background checks.",
        ),
        ex(
            "Regulator fines background screening company under FCRA",
            "The consumer reporting agency settled enforcement claims over inaccurate \
             background check reports and failure to follow adverse action rules.",
        ),
        ex(
            "New data protection rules for pre-employment screening",
            "Data privacy regulators issued guidance on processing criminal records and \
             personal data in employment vetting and background screening.",
        ),
        ex(
            "Right to work check requirements updated",
            "Employers must verify identity documents and immigration status under \
             updated right to work checks, with civil penalties for non-compliance.",
        ),
        ex(
            "Court rules on drug testing policy for employees",
            "A class action lawsuit challenges the employer's pre-employment drug \
             testing and credit check policies under state law.",
        ),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Region/topic rules file. Falls back to the built-in taxonomy rules.
    pub rules_path: Option<PathBuf>,
    /// Refine lexical labels with the judgment model.
    pub use_model: bool,
    /// Retries with expanded context after schema-invalid model output.
    pub max_retries: u32,
    /// Minimum accumulated rule weight before a specific region beats `global`.
    pub region_min_weight: f32,
    /// Characters of body text sent to the model on the first attempt.
    pub context_chars: usize,
    /// Labeled examples quoted in model prompts; selected by the optimizer.
    pub few_shot: Vec<FewShot>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            use_model: true,
            max_retries: 1,
            region_min_weight: 1.0,
            context_chars: 600,
            few_shot: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShot {
    pub title: String,
    pub region: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Snapshot directory. `None` keeps the store in memory only.
    pub data_dir: Option<PathBuf>,
    /// Articles older than this move to the cold partition.
    pub hot_horizon_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: Some(PathBuf::from("data")),
            hot_horizon_days: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub default_k: usize,
    pub overfetch_factor: usize,
    pub simple_deadline_ms: u64,
    pub complex_deadline_ms: u64,
    /// Minimum candidate score for a citation.
    pub evidence_bar: f32,
    pub max_cycles: u32,
    pub vector_weight: f32,
    pub metadata_weight: f32,
    /// Default window for "recent" when the question names no span.
    pub recent_days: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            overfetch_factor: 3,
            simple_deadline_ms: 3_000,
            complex_deadline_ms: 10_000,
            evidence_bar: 0.25,
            max_cycles: 2,
            vector_weight: 0.6,
            metadata_weight: 0.4,
            recent_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    pub uncertainty_weight: f32,
    pub novelty_weight: f32,
    pub drift_weight: f32,
    /// New examples required before a recompilation attempt.
    pub batch_size: usize,
    pub validation_ratio: f32,
    pub log_path: PathBuf,
    pub pointer_path: PathBuf,
    /// Review-queue / low-confidence candidates offered per selection round.
    pub select_limit: usize,
    /// Classifications below this confidence are labeling candidates.
    pub low_confidence: f32,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            uncertainty_weight: 0.5,
            novelty_weight: 0.3,
            drift_weight: 0.2,
            batch_size: 50,
            validation_ratio: 0.2,
            log_path: PathBuf::from("data/training.jsonl"),
            pointer_path: PathBuf::from("data/deployed.json"),
            select_limit: 25,
            low_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Simultaneous outstanding calls to external services.
    pub concurrency: usize,
    pub external_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            external_timeout_ms: 4_000,
        }
    }
}

impl RuntimeConfig {
    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }
}

/* ----------------------------
Loading
---------------------------- */

impl PipelineConfig {
    /// Resolve the path from `TRIAGE_CONFIG_PATH` (or the default) and load.
    /// A missing default file yields built-in defaults; a missing explicit path is an error.
    pub fn load() -> Result<Self, ConfigError> {
        let (path, explicit) = match env::var(ENV_CONFIG_PATH) {
            Ok(p) if !p.trim().is_empty() => (PathBuf::from(p), true),
            _ => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        if !explicit && !path.exists() {
            info!(target: "config", path = %path.display(), "no config file, using defaults");
            let mut cfg = Self::default();
            cfg.apply_env_overrides()?;
            cfg.sanitize();
            return Ok(cfg);
        }
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        cfg.apply_env_overrides()?;
        cfg.sanitize();
        info!(target: "config", path = %path.display(), "pipeline config loaded");
        Ok(cfg)
    }

    /// Parse without env overrides (tests and embedded defaults).
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let mut cfg: PipelineConfig = toml::from_str(s).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = parse_unit_env(ENV_HIGH_THRESHOLD)? {
            self.scoring.high_threshold = v;
        }
        if let Some(v) = parse_unit_env(ENV_LOW_THRESHOLD)? {
            self.scoring.low_threshold = v;
        }
        if let Ok(raw) = env::var(ENV_CONCURRENCY) {
            let n = raw
                .trim()
                .parse::<usize>()
                .map_err(|error| ConfigError::Invalid {
                    name: ENV_CONCURRENCY,
                    source: anyhow::Error::new(error),
                })?;
            if n == 0 {
                return Err(ConfigError::Invalid {
                    name: ENV_CONCURRENCY,
                    source: anyhow::anyhow!("must be greater than zero"),
                });
            }
            self.runtime.concurrency = n;
        }
        Ok(())
    }

    /// Clamp thresholds into range and keep `low <= high`.
    pub fn sanitize(&mut self) {
        let d = DedupConfig::default();
        self.dedup.similarity_threshold =
            unit_or(self.dedup.similarity_threshold, d.similarity_threshold);
        self.dedup.title_weight = unit_or(self.dedup.title_weight, d.title_weight);
        self.dedup.shingle_size = self.dedup.shingle_size.max(1);
        self.dedup.retention_days = self.dedup.retention_days.max(1);
        self.dedup.window_capacity = self.dedup.window_capacity.max(1);

        if let Some(t) = self.prefilter.threshold {
            self.prefilter.threshold = if t.is_finite() {
                Some(t.clamp(0.0, 1.0))
            } else {
                None
            };
        }

        let s = ScoringConfig::default();
        let sc = &mut self.scoring;
        sc.lexical_weight = non_negative_or(sc.lexical_weight, s.lexical_weight);
        sc.semantic_weight = non_negative_or(sc.semantic_weight, s.semantic_weight);
        sc.model_weight = non_negative_or(sc.model_weight, s.model_weight);
        if sc.lexical_weight + sc.semantic_weight + sc.model_weight <= f32::EPSILON {
            warn!(target: "config", "all scoring weights are zero, restoring defaults");
            sc.lexical_weight = s.lexical_weight;
            sc.semantic_weight = s.semantic_weight;
            sc.model_weight = s.model_weight;
        }
        sc.high_threshold = unit_or(sc.high_threshold, s.high_threshold);
        sc.low_threshold = unit_or(sc.low_threshold, s.low_threshold);
        if sc.low_threshold > sc.high_threshold {
            std::mem::swap(&mut sc.low_threshold, &mut sc.high_threshold);
        }
        sc.min_signal_bar = unit_or(sc.min_signal_bar, s.min_signal_bar);
        sc.reputation_prior_weight = unit_or(sc.reputation_prior_weight, s.reputation_prior_weight);
        if !(sc.density_saturation.is_finite() && sc.density_saturation > 0.0) {
            sc.density_saturation = s.density_saturation;
        }

        self.agent.evidence_bar = unit_or(self.agent.evidence_bar, AgentConfig::default().evidence_bar);
        self.agent.default_k = self.agent.default_k.max(1);
        self.agent.overfetch_factor = self.agent.overfetch_factor.max(1);
        self.agent.max_cycles = self.agent.max_cycles.max(1);

        self.optimize.validation_ratio = self.optimize.validation_ratio.clamp(0.05, 0.5);
        self.optimize.batch_size = self.optimize.batch_size.max(1);

        self.runtime.concurrency = self.runtime.concurrency.max(1);
        self.runtime.external_timeout_ms = self.runtime.external_timeout_ms.max(1);
    }
}

fn unit_or(v: f32, fallback: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

fn non_negative_or(v: f32, fallback: f32) -> f32 {
    if v.is_finite() && v >= 0.0 {
        v
    } else {
        fallback
    }
}

// parse optional float env and clamp to <0.0..=1.0>
fn parse_unit_env(name: &'static str) -> Result<Option<f32>, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<f32>()
            .map(|v| Some(v.clamp(0.0, 1.0)))
            .map_err(|error| ConfigError::Invalid {
                name,
                source: anyhow::Error::new(error),
            }),
        _ => Ok(None),
    }
}

// src/prefilter.rs
//! Relevance pre-filter: tokenizer, keyword config types, regex compilation,
//! proximity checks, a token log-odds model and the permissive pass policy.
//!
//! The same compiled keyword set also yields the scorer's lexical density signal.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::config::PrefilterConfig;

pub const DEFAULT_RULES: &str = include_str!("../config/prefilter.toml");
pub const ENV_PREFILTER_RULES_PATH: &str = "PREFILTER_RULES_PATH";
pub const ENV_PREFILTER_HOT_RELOAD: &str = "PREFILTER_HOT_RELOAD";

/// Short, non-reversible id for log lines. Article text is never logged.
pub(crate) fn anon_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

pub(crate) fn truncate_vec<T: ToString>(v: &[T], max: usize) -> Vec<String> {
    v.iter().take(max).map(|x| x.to_string()).collect()
}

/// Gate decision for one article.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize)]
pub struct PrefilterOutcome {
    pub passes: bool,
    /// Strength of the relevance evidence in [0, 1] (max of both signals).
    pub confidence: f32,
    pub lexical_score: f32,
    pub model_score: f32,
    pub matched: Vec<String>,
    pub reasons: Vec<String>,
}

/// A single token with byte span and sequential index
#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub index: usize,
}

static RE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?u)\b\w+\b").expect("tokenizer regex"));

/// Basic, Unicode-friendly tokenizer.
pub fn tokenize(input: &str) -> Vec<Token> {
    RE_TOKEN
        .find_iter(input)
        .enumerate()
        .map(|(i, m)| Token {
            text: input[m.start()..m.end()].to_string(),
            start: m.start(),
            end: m.end(),
            index: i,
        })
        .collect()
}

/// Tokens plus a byte → token-index map for proximity checks.
#[allow(clippy::needless_range_loop)]
pub fn tokenize_with_index(text: &str) -> (Vec<Token>, Vec<usize>) {
    let tokens = tokenize(text);
    let mut byte_to_tok = vec![usize::MAX; text.len() + 1];
    for t in &tokens {
        for i in t.start..=t.end {
            byte_to_tok[i] = t.index;
        }
    }
    // Backfill gaps with previous known index
    let mut last = usize::MAX;
    for i in 0..byte_to_tok.len() {
        if byte_to_tok[i] == usize::MAX {
            byte_to_tok[i] = last;
        } else {
            last = byte_to_tok[i];
        }
    }
    (tokens, byte_to_tok)
}

/// Return true if any main-match token is within `window` tokens of any near-match token.
pub(crate) fn within_window(main_idxs: &[usize], near_idxs: &[usize], window: usize) -> bool {
    main_idxs
        .iter()
        .any(|&a| near_idxs.iter().any(|&b| a.abs_diff(b) <= window))
}

/// Token indices for all matches of `re`, using the byte→token map.
pub(crate) fn match_token_indices(re: &Regex, text: &str, byte_to_tok: &[usize]) -> Vec<usize> {
    re.find_iter(text)
        .filter_map(|m| byte_to_tok.get(m.start()).copied().filter(|&i| i != usize::MAX))
        .collect()
}

/* ----------------------------
Config schema (from TOML)
---------------------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct PrefilterRules {
    pub gate: GateSection,
    pub weights: HashMap<String, i32>,
    #[serde(default)]
    pub anchors: Vec<AnchorCfg>,
    #[serde(default)]
    pub blockers: Vec<BlockerCfg>,
    #[serde(default)]
    pub combos: ComboCfg,
    #[serde(default)]
    pub aliases: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub model: TokenModelCfg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateSection {
    pub threshold: f32,
    #[serde(default = "default_model_bar")]
    pub model_bar: f32,
    #[serde(default = "default_near_window")]
    pub near_default_window: usize,
}

fn default_model_bar() -> f32 {
    0.5
}
fn default_near_window() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnchorCfg {
    pub id: String,
    pub category: String,
    pub pattern: String,
    /// A single qualified hit admits the article on its own.
    #[serde(default)]
    pub strong: bool,
    #[serde(default)]
    pub near: Option<NearCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockerCfg {
    pub id: String,
    pub pattern: String,
    pub reason: String,
    #[serde(default)]
    pub near: Option<NearCfg>,
    #[serde(default)]
    pub unless_near: Option<NearCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NearCfg {
    pub pattern: String,
    #[serde(default)]
    pub window: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComboCfg {
    #[serde(default)]
    pub pass_any: Vec<ComboNeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComboNeed {
    pub need: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenModelCfg {
    #[serde(default)]
    pub bias: f32,
    #[serde(default)]
    pub tokens: HashMap<String, f32>,
}

/* ----------------------------
Compiled engine structures
---------------------------- */

#[derive(Debug)]
struct CompiledAnchor {
    cfg: AnchorCfg,
    re: Regex,
    near: Option<(Regex, usize)>,
}

#[derive(Debug)]
struct CompiledBlocker {
    cfg: BlockerCfg,
    re: Regex,
    near: Option<(Regex, usize)>,
    unless_near: Option<(Regex, usize)>,
}

/// Per-text anchor statistics.
#[derive(Debug, Default)]
struct AnchorStats {
    matched: Vec<String>,
    /// Distinct anchors per category.
    categories: HashMap<String, usize>,
    /// Total qualified hits weighted by category weight.
    weighted_hits: f32,
    strong: bool,
}

#[derive(Debug)]
pub struct PrefilterEngine {
    pub rules: PrefilterRules,
    anchors: Vec<CompiledAnchor>,
    blockers: Vec<CompiledBlocker>,
    // lowercased token weights
    token_weights: HashMap<String, f32>,
}

fn compile_near(owner: &str, what: &str, nc: &Option<NearCfg>, default_window: usize) -> anyhow::Result<Option<(Regex, usize)>> {
    match nc {
        Some(nc) => {
            let re = Regex::new(&nc.pattern)
                .map_err(|e| anyhow::anyhow!("`{owner}` {what} regex error: {e}"))?;
            Ok(Some((re, nc.window.unwrap_or(default_window))))
        }
        None => Ok(None),
    }
}

impl PrefilterEngine {
    /// Built-in rule set.
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(DEFAULT_RULES)
    }

    /// Resolve rules from `[prefilter].rules_path`, then `PREFILTER_RULES_PATH`,
    /// then the built-in set; apply the threshold override.
    pub fn load(cfg: &PrefilterConfig) -> anyhow::Result<Self> {
        let path = Self::rules_path(cfg);
        let mut eng = match &path {
            Some(p) => {
                let content = fs::read_to_string(p).map_err(|e| {
                    anyhow::anyhow!("Failed to read prefilter rules at {}: {}", p.display(), e)
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::builtin()?,
        };
        if let Some(t) = cfg.threshold {
            eng.rules.gate.threshold = t;
        }
        info!(
            target: "prefilter",
            anchors = eng.anchors.len(),
            blockers = eng.blockers.len(),
            threshold = eng.rules.gate.threshold,
            "prefilter rules loaded"
        );
        Ok(eng)
    }

    pub fn rules_path(cfg: &PrefilterConfig) -> Option<PathBuf> {
        cfg.rules_path
            .clone()
            .or_else(|| std::env::var(ENV_PREFILTER_RULES_PATH).ok().map(PathBuf::from))
    }

    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let mut rules: PrefilterRules = toml::from_str(toml_str)?;
        if !rules.gate.threshold.is_finite() {
            rules.gate.threshold = 0.15;
        }
        rules.gate.threshold = rules.gate.threshold.clamp(0.0, 1.0);
        rules.gate.model_bar = if rules.gate.model_bar.is_finite() {
            rules.gate.model_bar.clamp(0.0, 1.0)
        } else {
            default_model_bar()
        };
        let win = rules.gate.near_default_window;

        let anchors = rules
            .anchors
            .iter()
            .cloned()
            .map(|a| {
                let re = Regex::new(&a.pattern)
                    .map_err(|e| anyhow::anyhow!("anchor `{}` regex error: {}", a.id, e))?;
                let near = compile_near(&a.id, "near", &a.near, win)?;
                Ok(CompiledAnchor { cfg: a, re, near })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let blockers = rules
            .blockers
            .iter()
            .cloned()
            .map(|b| {
                let re = Regex::new(&b.pattern)
                    .map_err(|e| anyhow::anyhow!("blocker `{}` regex error: {}", b.id, e))?;
                let near = compile_near(&b.id, "near", &b.near, win)?;
                let unless_near = compile_near(&b.id, "unless_near", &b.unless_near, win)?;
                Ok(CompiledBlocker {
                    cfg: b,
                    re,
                    near,
                    unless_near,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let token_weights = rules
            .model
            .tokens
            .iter()
            .map(|(k, v)| (k.to_lowercase(), *v))
            .collect();

        Ok(Self {
            rules,
            anchors,
            blockers,
            token_weights,
        })
    }

    /// Blockers that apply to `text` considering optional `near`/`unless_near`.
    pub fn find_blockers(&self, text: &str) -> Vec<String> {
        let (_tokens, byte_to_tok) = tokenize_with_index(text);
        let mut hits = Vec::new();
        for b in &self.blockers {
            let main_idxs = match_token_indices(&b.re, text, &byte_to_tok);
            if main_idxs.is_empty() {
                continue;
            }
            if let Some((near_re, win)) = &b.near {
                let near_idxs = match_token_indices(near_re, text, &byte_to_tok);
                if !within_window(&main_idxs, &near_idxs, *win) {
                    continue;
                }
            }
            if let Some((unless_re, win)) = &b.unless_near {
                let unless_idxs = match_token_indices(unless_re, text, &byte_to_tok);
                if within_window(&main_idxs, &unless_idxs, *win) {
                    continue;
                }
            }
            hits.push(format!("blocker:{}:{}", b.cfg.id, b.cfg.reason));
        }
        hits
    }

    fn collect_anchor_stats(&self, text: &str) -> AnchorStats {
        let (_tokens, byte_to_tok) = tokenize_with_index(text);
        let mut stats = AnchorStats::default();

        for a in &self.anchors {
            let mut main_idxs = match_token_indices(&a.re, text, &byte_to_tok);
            if main_idxs.is_empty() {
                continue;
            }
            // keep only hits that satisfy the proximity requirement
            if let Some((near_re, win)) = &a.near {
                let near_idxs = match_token_indices(near_re, text, &byte_to_tok);
                main_idxs.retain(|&m| within_window(&[m], &near_idxs, *win));
                if main_idxs.is_empty() {
                    continue;
                }
            }
            let w = self.rules.weights.get(&a.cfg.category).copied().unwrap_or(0).max(0) as f32;
            stats.weighted_hits += w * main_idxs.len() as f32;
            stats.matched.push(a.cfg.id.clone());
            *stats.categories.entry(a.cfg.category.clone()).or_insert(0) += 1;
            stats.strong |= a.cfg.strong;
        }

        stats.matched.sort();
        stats.matched.dedup();
        stats
    }

    fn expand_alias<'a>(&'a self, token: &'a str) -> Vec<&'a str> {
        if let Some(v) = self.rules.aliases.get(token) {
            return v.iter().map(|s| s.as_str()).collect();
        }
        vec![token]
    }

    /// First pass-combo template satisfied by the category counts. Each need
    /// "spends" one anchor from the pool.
    fn combo_satisfied(&self, categories: &HashMap<String, usize>) -> Option<String> {
        'outer: for tpl in &self.rules.combos.pass_any {
            let mut pool = categories.clone();
            let mut used = Vec::new();
            for need in &tpl.need {
                let mut satisfied = false;
                for ch in self.expand_alias(need) {
                    if let Some(cnt) = pool.get_mut(ch) {
                        if *cnt > 0 {
                            *cnt -= 1;
                            used.push(ch.to_string());
                            satisfied = true;
                            break;
                        }
                    }
                }
                if !satisfied {
                    continue 'outer;
                }
            }
            return Some(format!("combo:{}", used.join("+")));
        }
        None
    }

    /// Normalized score in ⟨0..1⟩ using category weights (cap each category count at 3).
    fn weighted_score(&self, categories: &HashMap<String, usize>) -> f32 {
        let mut num = 0i32;
        let mut denom = 0i32;
        for (cat, w) in &self.rules.weights {
            let w = (*w).max(0);
            let cnt = *categories.get(cat).unwrap_or(&0);
            num += cnt.min(3) as i32 * w;
            denom += 3 * w;
        }
        if denom <= 0 {
            return 0.0;
        }
        num as f32 / denom as f32
    }

    /// Token log-odds probability in (0, 1).
    pub fn model_probability(&self, text: &str) -> f32 {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for t in tokenize(text) {
            let key = t.text.to_lowercase();
            if self.token_weights.contains_key(&key) {
                *counts.entry(key).or_insert(0) += 1;
            }
        }
        let z = counts.iter().fold(self.rules.model.bias, |acc, (tok, n)| {
            acc + self.token_weights.get(tok).copied().unwrap_or(0.0) * (*n).min(2) as f32
        });
        1.0 / (1.0 + (-z).exp())
    }

    /// Weighted keyword hits per 100 tokens, saturating at `saturation`.
    pub fn keyword_density(&self, text: &str, saturation: f32) -> f32 {
        let n_tokens = tokenize(text).len();
        if n_tokens == 0 || !self.find_blockers(text).is_empty() {
            return 0.0;
        }
        let stats = self.collect_anchor_stats(text);
        let per_100 = stats.weighted_hits * 100.0 / n_tokens as f32;
        (per_100 / saturation.max(f32::EPSILON)).clamp(0.0, 1.0)
    }

    /// Permissive gate: blockers → anchors → (strong | combo | threshold | model).
    pub fn evaluate(&self, text: &str) -> PrefilterOutcome {
        let mut out = PrefilterOutcome::default();

        let blockers = self.find_blockers(text);
        if !blockers.is_empty() {
            out.reasons.extend(blockers);
            dev_log("blocked", text, &out);
            return out;
        }

        let stats = self.collect_anchor_stats(text);
        let lexical = self.weighted_score(&stats.categories);
        let model = self.model_probability(text);
        let gate = &self.rules.gate;

        if stats.strong {
            out.reasons.push("strong_anchor".into());
        }
        if let Some(c) = self.combo_satisfied(&stats.categories) {
            out.reasons.push(c);
        }
        if lexical >= gate.threshold {
            out.reasons.push(format!("threshold_ok:{:.2}", gate.threshold));
        }
        if model >= gate.model_bar {
            out.reasons.push(format!("model_ok:{:.2}", gate.model_bar));
        }

        out.passes = !out.reasons.is_empty();
        if !out.passes {
            out.reasons.push("no_signal".into());
        }
        out.lexical_score = lexical;
        out.model_score = model;
        out.confidence = lexical.max(model).clamp(0.0, 1.0);
        out.matched = stats.matched;

        dev_log(if out.passes { "passed" } else { "rejected" }, text, &out);
        out
    }
}

fn dev_log(event: &str, text: &str, out: &PrefilterOutcome) {
    debug!(
        target: "prefilter",
        id = %anon_hash(text),
        event,
        confidence = out.confidence,
        matched = ?truncate_vec(&out.matched, 5),
        reasons = ?truncate_vec(&out.reasons, 5)
    );
}

/* ----------------------------
Thread-safe handle + hot reload
---------------------------- */

/// Shared engine handle; the hot-reload poller swaps the inner engine.
#[derive(Clone)]
pub struct PrefilterHandle {
    inner: Arc<RwLock<PrefilterEngine>>,
}

impl PrefilterHandle {
    pub fn new(engine: PrefilterEngine) -> Self {
        Self {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    pub fn evaluate(&self, text: &str) -> PrefilterOutcome {
        self.inner.read().evaluate(text)
    }

    pub fn keyword_density(&self, text: &str, saturation: f32) -> f32 {
        self.inner.read().keyword_density(text, saturation)
    }

    pub fn replace(&self, engine: PrefilterEngine) {
        *self.inner.write() = engine;
    }
}

/// Dev only: `PREFILTER_HOT_RELOAD=1` in a debug build or with `TRIAGE_ENV` set to a dev value.
fn hot_reload_enabled() -> bool {
    if std::env::var(ENV_PREFILTER_HOT_RELOAD).ok().as_deref() != Some("1") {
        return false;
    }
    if cfg!(debug_assertions) {
        return true;
    }
    matches!(
        std::env::var("TRIAGE_ENV")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "local" | "development" | "dev"
    )
}

/// Poll `path` mtime every 2s and swap in a freshly compiled engine on change.
/// Returns false when hot reload is disabled.
pub fn start_hot_reload_thread(handle: PrefilterHandle, path: PathBuf) -> bool {
    if !hot_reload_enabled() {
        return false;
    }
    info!(target: "prefilter", path = %path.display(), "prefilter hot reload enabled");

    thread::spawn(move || {
        let poll = Duration::from_secs(2);
        let mut last_mtime: Option<SystemTime> = None;
        loop {
            if let Ok(mtime) = fs::metadata(&path).and_then(|m| m.modified()) {
                let changed = matches!(last_mtime, Some(prev) if mtime > prev);
                if changed {
                    reload_into(&handle, &path);
                }
                last_mtime = Some(mtime);
            }
            thread::sleep(poll);
        }
    });
    true
}

/// Recompile from `path`; a broken file keeps the current engine.
pub fn reload_into(handle: &PrefilterHandle, path: &Path) -> bool {
    match fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|c| PrefilterEngine::from_toml_str(&c))
    {
        Ok(engine) => {
            handle.replace(engine);
            info!(target: "prefilter", path = %path.display(), "prefilter rules reloaded");
            true
        }
        Err(e) => {
            warn!(target: "prefilter", error = %e, "prefilter reload failed, keeping current rules");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_TOML: &str = r#"
[gate]
threshold = 0.30
model_bar = 0.9

[weights]
hard = 3
semi = 2
ctx = 1

[[anchors]]
id = "screening"
category = "hard"
strong = true
pattern = "(?i)\\bbackground checks?\\b"

[[anchors]]
id = "records"
category = "semi"
pattern = "(?i)\\bcriminal records?\\b"

[[anchors]]
id = "credit"
category = "semi"
pattern = "(?i)\\bcredit checks?\\b"
near = { pattern = "(?i)\\bhiring\\b", window = 3 }

[[anchors]]
id = "employers"
category = "ctx"
pattern = "(?i)\\bemployers?\\b"

[[blockers]]
id = "lending"
pattern = "(?i)\\bcredit checks?\\b"
near = { pattern = "(?i)\\bmortgage\\b", window = 4 }
unless_near = { pattern = "(?i)\\bhiring\\b", window = 4 }
reason = "consumer lending"

[combos]
pass_any = [{ need = ["semi", "ctx"] }]

[model]
bias = -3.0
[model.tokens]
screening = 2.0
"#;

    fn eng() -> PrefilterEngine {
        PrefilterEngine::from_toml_str(TEST_TOML).expect("load test config")
    }

    #[test]
    fn tokenizer_basic() {
        let toks = tokenize("Ban the box, again.");
        assert_eq!(
            toks.iter().map(|t| t.text.as_str()).collect::<Vec<_>>(),
            vec!["Ban", "the", "box", "again"]
        );
    }

    #[test]
    fn strong_anchor_admits_alone() {
        let r = eng().evaluate("A story about background checks.");
        assert!(r.passes);
        assert!(r.reasons.iter().any(|s| s == "strong_anchor"));
    }

    #[test]
    fn combo_admits_semi_with_context() {
        let r = eng().evaluate("Employers may no longer ask about criminal records.");
        assert!(r.passes, "{r:?}");
        assert!(r.reasons.iter().any(|s| s.starts_with("combo:")));
    }

    #[test]
    fn proximity_qualifies_anchor() {
        let e = eng();
        let far = e.evaluate("Credit checks are common. Much later in a long unrelated passage we mention hiring.");
        assert!(!far.matched.iter().any(|m| m == "credit"));
        let near = e.evaluate("Credit checks during hiring.");
        assert!(near.matched.iter().any(|m| m == "credit"));
    }

    #[test]
    fn blocker_respects_unless_near() {
        let e = eng();
        let r = e.evaluate("Mortgage lenders run credit checks on borrowers.");
        assert!(!r.passes);
        assert!(r.reasons.iter().any(|s| s.contains("lending")));
        let r = e.evaluate("Mortgage firm stops credit checks in hiring, employers say.");
        assert!(!r.reasons.iter().any(|s| s.contains("lending")));
    }

    #[test]
    fn irrelevant_text_is_rejected_with_score() {
        let r = eng().evaluate("The football league announced a new schedule.");
        assert!(!r.passes);
        assert_eq!(r.lexical_score, 0.0);
        assert!(r.model_score < 0.1);
        assert!(r.reasons.iter().any(|s| s == "no_signal"));
    }

    #[test]
    fn model_probability_increases_with_evidence() {
        let e = eng();
        let lo = e.model_probability("nothing here");
        let hi = e.model_probability("screening screening");
        assert!(hi > lo);
        assert!((lo - 1.0 / (1.0 + 3.0f32.exp())).abs() < 1e-5);
    }

    #[test]
    fn density_is_bounded() {
        let e = eng();
        let d = e.keyword_density("background check background check", 6.0);
        assert!((0.0..=1.0).contains(&d));
        assert_eq!(d, 1.0);
        assert_eq!(e.keyword_density("", 6.0), 0.0);
    }

    #[test]
    fn builtin_rules_compile() {
        let e = PrefilterEngine::builtin().unwrap();
        assert!(e.evaluate("California expands Ban the Box to more employers").passes);
    }

    #[test]
    fn reload_keeps_engine_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("rules.toml");
        fs::write(&p, "not = [valid").unwrap();
        let h = PrefilterHandle::new(eng());
        assert!(!reload_into(&h, &p));
        assert!(h.evaluate("background check").passes);
        fs::write(&p, TEST_TOML.replace("background checks?", "drug tests?")).unwrap();
        assert!(reload_into(&h, &p));
        assert!(!h.evaluate("background check").passes);
    }
}

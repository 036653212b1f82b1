// src/ingest/config.rs
//! Source priority order used to break dedup ties (earlier = higher priority).
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const ENV_PATH: &str = "TRIAGE_SOURCE_PRIORITY_PATH";

/// Ordered source list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePriority {
    order: Vec<String>,
}

impl SourcePriority {
    pub fn new(items: Vec<String>) -> Self {
        Self {
            order: clean_list(items),
        }
    }

    /// Rank of `source`; unknown sources rank after every listed one.
    pub fn rank(&self, source: &str) -> usize {
        let key = source.trim();
        self.order
            .iter()
            .position(|s| s.eq_ignore_ascii_case(key))
            .unwrap_or(self.order.len())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.order
    }
}

/// Load priority list from an explicit path. Supports TOML or JSON formats.
pub fn load_priority_from(path: &Path) -> Result<SourcePriority> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading source priority from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_priority(&content, ext.as_str()).map(SourcePriority::new)
}

/// Load priority list using env var + fallbacks:
/// 1) $TRIAGE_SOURCE_PRIORITY_PATH
/// 2) config/source_priority.toml
/// 3) config/source_priority.json
pub fn load_priority_default() -> Result<SourcePriority> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_priority_from(&pb);
        } else {
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/source_priority.toml");
    if toml_p.exists() {
        return load_priority_from(&toml_p);
    }
    let json_p = PathBuf::from("config/source_priority.json");
    if json_p.exists() {
        return load_priority_from(&json_p);
    }
    Ok(SourcePriority::default())
}

fn parse_priority(s: &str, hint_ext: &str) -> Result<Vec<String>> {
    let try_toml = hint_ext == "toml" || s.contains("sources");
    if try_toml {
        if let Ok(v) = parse_toml(s) {
            return Ok(v);
        }
    }
    if let Ok(v) = parse_json(s) {
        return Ok(v);
    }
    if !try_toml {
        if let Ok(v) = parse_toml(s) {
            return Ok(v);
        }
    }
    Err(anyhow!("unsupported source priority format"))
}

fn parse_toml(s: &str) -> Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct TomlList {
        sources: Vec<String>,
    }
    let v: TomlList = toml::from_str(s)?;
    Ok(v.sources)
}

fn parse_json(s: &str) -> Result<Vec<String>> {
    let v: Vec<String> = serde_json::from_str(s)?;
    Ok(v)
}

// Order matters here: trim, drop empties, keep first occurrence.
fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for it in items {
        let t = it.trim();
        if !t.is_empty() && !out.iter().any(|s| s.eq_ignore_ascii_case(t)) {
            out.push(t.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    #[test]
    fn order_is_kept_and_duplicates_dropped() {
        let toml = r#"sources = [" Reuters ", "", "AP", "reuters"]"#;
        let p = SourcePriority::new(parse_priority(toml, "toml").unwrap());
        assert_eq!(p.as_slice(), &["Reuters".to_string(), "AP".to_string()]);
        assert_eq!(p.rank("reuters"), 0);
        assert_eq!(p.rank("AP"), 1);
        assert_eq!(p.rank("Blog"), 2);

        let json = r#"["Law360", "  JD Supra  "]"#;
        let p = SourcePriority::new(parse_priority(json, "json").unwrap());
        assert_eq!(p.rank("jd supra"), 1);
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();

        env::remove_var(ENV_PATH);
        let v = load_priority_default().unwrap();
        assert!(v.as_slice().is_empty());

        let p_json = tmp.path().join("prio.json");
        fs::write(&p_json, r#"["X", "Y"]"#).unwrap();
        env::set_var(ENV_PATH, p_json.display().to_string());
        let v2 = load_priority_default().unwrap();
        assert_eq!(v2.rank("Y"), 1);
        env::remove_var(ENV_PATH);

        env::set_var(ENV_PATH, tmp.path().join("nope.toml").display().to_string());
        assert!(load_priority_default().is_err());
        env::remove_var(ENV_PATH);

        env::set_current_dir(&old).unwrap();
    }
}

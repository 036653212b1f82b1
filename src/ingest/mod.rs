// src/ingest/mod.rs
//! Normalizer: raw collector records into immutable `Article`s.

pub mod config;
pub mod scheduler;
pub mod types;

use chrono::{DateTime, Utc};
use lingua::{Language, LanguageDetector, LanguageDetectorBuilder};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::MalformedInputError;
use crate::model::Article;
pub use types::{DocumentCollector, RawDocument};

pub const TITLE_MAX_CHARS: usize = 500;
pub const BODY_MAX_CHARS: usize = 40_000;
pub const SUMMARY_MAX_CHARS: usize = 280;
/// Shorter texts are reported as `und`.
pub const LANG_DETECT_MIN_CHARS: usize = 20;
pub const UNDETERMINED_LANGUAGE: &str = "und";

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>|</?[a-z!][^>]*>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

static DETECTOR: Lazy<LanguageDetector> = Lazy::new(|| {
    LanguageDetectorBuilder::from_languages(&[
        Language::English,
        Language::Spanish,
        Language::French,
        Language::German,
        Language::Portuguese,
        Language::Italian,
        Language::Dutch,
        Language::Japanese,
        Language::Chinese,
    ])
    .with_minimum_relative_distance(0.05)
    .build()
});

/// Decode entities, strip markup, fold quotes, collapse whitespace, cap length.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    // entities first so encoded markup (&lt;b&gt;) is stripped too
    let decoded = html_escape::decode_html_entities(s);
    let stripped = RE_TAGS.replace_all(&decoded, " ");

    let folded = stripped
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");

    let mut out = RE_WS.replace_all(&folded, " ").trim().to_string();
    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect();
        out.truncate(out.trim_end().len());
    }
    out
}

/// Titles additionally lose trailing sentence punctuation.
pub fn normalize_title(s: &str) -> String {
    let mut out = normalize_text(s, TITLE_MAX_CHARS);
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',' | ':' | ';') {
            out.pop();
        } else {
            break;
        }
    }
    out.truncate(out.trim_end().len());
    out
}

/// Hex SHA-256 over the normalized title and body. Case-insensitive so that
/// trivially re-cased re-publications collapse at the exact gate.
pub fn content_hash(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(body.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// ISO 639-1 code of the dominant language, or `und`.
pub fn detect_language(text: &str) -> String {
    if text.chars().filter(|c| c.is_alphabetic()).count() < LANG_DETECT_MIN_CHARS {
        return UNDETERMINED_LANGUAGE.to_string();
    }
    match DETECTOR.detect_language_of(text) {
        Some(lang) => lang.iso_code_639_1().to_string().to_lowercase(),
        None => UNDETERMINED_LANGUAGE.to_string(),
    }
}

/// Leading sentences of `body`, up to `SUMMARY_MAX_CHARS`. The first sentence
/// is cut on a word boundary when it alone exceeds the cap.
pub fn lead_summary(body: &str) -> String {
    let mut out = String::new();
    for sentence in body.unicode_sentences() {
        let s = sentence.trim();
        if s.is_empty() {
            continue;
        }
        let next_len = out.chars().count() + s.chars().count() + usize::from(!out.is_empty());
        if next_len > SUMMARY_MAX_CHARS {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(s);
    }
    if out.is_empty() {
        let mut cut = String::new();
        for word in body.split_word_bounds() {
            if cut.chars().count() + word.chars().count() > SUMMARY_MAX_CHARS {
                break;
            }
            cut.push_str(word);
        }
        out = cut.trim().to_string();
    }
    out
}

fn validate_url(raw: &str) -> Result<String, MalformedInputError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MalformedInputError::missing("url", None));
    }
    let parsed = reqwest::Url::parse(trimmed).map_err(|e| {
        MalformedInputError::invalid("url", e.to_string(), Some(trimmed.to_string()))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(MalformedInputError::invalid(
            "url",
            "expected an absolute http(s) url",
            Some(trimmed.to_string()),
        ));
    }
    Ok(parsed.to_string())
}

/// Pure transform of one raw record. `received_at` stands in for a missing
/// publication date.
pub fn normalize(raw: &RawDocument, received_at: DateTime<Utc>) -> Result<Article, MalformedInputError> {
    let url = validate_url(raw.url.as_deref().unwrap_or_default())?;

    let title = normalize_title(raw.title.as_deref().unwrap_or_default());
    if title.is_empty() {
        return Err(MalformedInputError::missing("title", Some(url)));
    }
    let body = normalize_text(raw.body.as_deref().unwrap_or_default(), BODY_MAX_CHARS);
    if body.is_empty() {
        return Err(MalformedInputError::missing("body", Some(url)));
    }

    let source = raw
        .source
        .as_deref()
        .map(|s| normalize_text(s, 120))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let language = raw
        .language
        .as_deref()
        .map(|l| l.trim().to_ascii_lowercase())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| detect_language(&format!("{title}. {body}")));

    Ok(Article {
        id: content_hash(&title, &body),
        summary: lead_summary(&body),
        title,
        body,
        url,
        source,
        published_at: raw.published_at.unwrap_or(received_at),
        language,
    })
}

/// Normalize a batch; malformed records are counted, logged and skipped.
pub fn normalize_batch(
    raws: &[RawDocument],
    received_at: DateTime<Utc>,
) -> (Vec<Article>, Vec<MalformedInputError>) {
    crate::metrics::ensure_described();
    counter!("triage_ingested_total").increment(raws.len() as u64);

    let mut articles = Vec::with_capacity(raws.len());
    let mut rejected = Vec::new();
    for raw in raws {
        match normalize(raw, received_at) {
            Ok(a) => articles.push(a),
            Err(e) => {
                tracing::warn!(target: "ingest", field = e.field, reason = %e.reason, url = ?e.url, "malformed input skipped");
                counter!("triage_malformed_total").increment(1);
                rejected.push(e);
            }
        }
    }
    (articles, rejected)
}

/// Pull one batch from every collector. A failing collector is logged and skipped.
pub async fn collect_once(collectors: &[Box<dyn DocumentCollector>]) -> Vec<RawDocument> {
    let mut raw = Vec::new();
    for c in collectors {
        match c.fetch_batch().await {
            Ok(mut v) => raw.append(&mut v),
            Err(e) => {
                tracing::warn!(target: "ingest", error = ?e, collector = c.name(), "collector error");
            }
        }
    }
    raw
}

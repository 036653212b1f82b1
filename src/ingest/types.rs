// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Record produced by an external collector. Every field is optional at the
/// wire level; the normalizer decides what is malformed.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RawDocument {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Crawler seam. Crawlers live outside this crate.
#[async_trait::async_trait]
pub trait DocumentCollector: Send + Sync {
    async fn fetch_batch(&self) -> Result<Vec<RawDocument>>;
    fn name(&self) -> &'static str;
}

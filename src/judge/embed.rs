// src/judge/embed.rs
//! Embedding service seam plus a local feature-hashing embedder.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::map_reqwest;
use crate::config::{ModelConfig, ModelProvider};
use crate::error::ServiceError;

pub const HASHING_DIMS: usize = 1024;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One L2-normalized vector per input text, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
    fn name(&self) -> &'static str;
}

pub type DynEmbedder = Arc<dyn Embedder>;

/// Cosine similarity; zero when either vector is empty or all-zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}

pub fn l2_normalize(v: &mut [f32]) {
    let n = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if n > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= n);
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "to", "was", "were", "will", "with", "this",
    "their", "new", "what", "which", "about", "after", "over", "more", "than",
];

/// Light suffix stripping so "regulations" and "regulation" share a bucket.
fn stem(w: &str) -> String {
    if w.len() > 4 && w.ends_with("ies") {
        return format!("{}y", &w[..w.len() - 3]);
    }
    if w.len() > 3 && w.ends_with('s') && !w.ends_with("ss") {
        return w[..w.len() - 1].to_string();
    }
    w.to_string()
}

pub(crate) fn content_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .map(|w| stem(&w))
        .collect()
}

fn fnv1a(s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

/// Deterministic bag-of-words embedder (signed feature hashing, sublinear tf).
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dims: HASHING_DIMS }
    }
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        for t in content_terms(text) {
            *counts.entry(t).or_insert(0) += 1;
        }
        let mut v = vec![0.0f32; self.dims];
        for (term, n) in counts {
            let h = fnv1a(&term);
            let idx = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign * (1.0 + (n as f32).ln());
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
    fn name(&self) -> &'static str {
        "hashing"
    }
}

/// OpenAI embeddings endpoint.
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .user_agent("article-triage/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            input: &'a [String],
        }
        #[derive(Deserialize)]
        struct Resp {
            data: Vec<Item>,
        }
        #[derive(Deserialize)]
        struct Item {
            index: usize,
            embedding: Vec<f32>,
        }

        let resp = self
            .http
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&Req {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(map_reqwest("embeddings"))?;
        if !resp.status().is_success() {
            return Err(ServiceError::BadResponse(format!("embeddings status {}", resp.status())));
        }
        let mut parsed: Resp = resp.json().await.map_err(map_reqwest("embeddings"))?;
        if parsed.data.len() != texts.len() {
            return Err(ServiceError::BadResponse(format!(
                "embeddings: expected {} vectors, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|i| i.index);
        Ok(parsed
            .data
            .into_iter()
            .map(|mut i| {
                l2_normalize(&mut i.embedding);
                i.embedding
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "openai-embeddings"
    }
}

/// OpenAI when configured, otherwise the local hashing embedder.
pub fn build_embedder(cfg: &ModelConfig, timeout: Duration) -> DynEmbedder {
    if cfg.provider == ModelProvider::Openai {
        match OpenAiEmbedder::new(cfg.api_key.clone(), cfg.embedding_model.clone(), timeout) {
            Ok(e) => return Arc::new(e),
            Err(e) => warn!(target: "judge", error = %e, "openai embedder unavailable, using hashing embedder"),
        }
    }
    Arc::new(HashingEmbedder::default())
}

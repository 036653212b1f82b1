// src/judge/mod.rs
//! Judgment model abstraction: provider trait, OpenAI + mock + disabled
//! providers, a file cache with a daily call budget, and the concurrency/timeout
//! gate every external call goes through.

pub mod embed;

use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{ModelConfig, ModelProvider};
use crate::error::ServiceError;
use crate::store::persist::{read_json, write_json_atomic};

pub use embed::{build_embedder, cosine_similarity, Embedder, HashingEmbedder, OpenAiEmbedder};

/// What the caller is asking for; selects the expected JSON shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgmentTask {
    /// `{"region": "...", "confidence": f, "rationale": "..."}`
    Region,
    /// `{"topics": ["..."], "confidence": f, "rationale": "..."}`
    Topics,
    /// `{"score": f}`
    Relevance,
    /// `{"scores": [f, ...]}` in candidate order
    Rerank,
    /// `{"answer": "...", "cited": ["id", ...], "confidence": f}`
    Answer,
}

impl JudgmentTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgmentTask::Region => "region",
            JudgmentTask::Topics => "topics",
            JudgmentTask::Relevance => "relevance",
            JudgmentTask::Rerank => "rerank",
            JudgmentTask::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentRequest {
    pub task: JudgmentTask,
    pub system: String,
    pub user: String,
    /// Deterministic local answer in the task's JSON shape. Remote providers
    /// ignore it; the mock echoes it.
    #[serde(default)]
    pub hint: Option<String>,
}

impl JudgmentRequest {
    pub fn new(task: JudgmentTask, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            task,
            system: system.into(),
            user: user.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Stable cache key over task, prompts and model.
    pub fn cache_key(&self, model: &str) -> String {
        let mut h = Sha256::new();
        h.update(model.as_bytes());
        h.update([0]);
        h.update(self.task.as_str().as_bytes());
        h.update([0]);
        h.update(self.system.as_bytes());
        h.update([0]);
        h.update(self.user.as_bytes());
        let digest = h.finalize();
        digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
    }
}

/// Raw text completion; callers validate the JSON they get back.
#[async_trait]
pub trait JudgmentModel: Send + Sync {
    async fn complete(&self, req: &JudgmentRequest) -> Result<String, ServiceError>;
    fn name(&self) -> &'static str;
}

pub type DynJudge = Arc<dyn JudgmentModel>;

/// Strip markdown code fences some models wrap JSON in.
pub fn strip_fences(s: &str) -> &str {
    let t = s.trim();
    let t = t
        .strip_prefix("```json")
        .or_else(|| t.strip_prefix("```"))
        .unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

/* ----------------------------
Providers
---------------------------- */

/// OpenAI Chat Completions in JSON mode.
pub struct OpenAiJudge {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiJudge {
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
impl JudgmentModel for OpenAiJudge {
    async fn complete(&self, req: &JudgmentRequest) -> Result<String, ServiceError> {
        if self.api_key.is_empty() {
            return Err(ServiceError::Unavailable("openai: missing api key".into()));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct ResponseFormat {
            r#type: &'static str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            response_format: ResponseFormat,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let body = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &req.system,
                },
                Msg {
                    role: "user",
                    content: &req.user,
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                r#type: "json_object",
            },
        };

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest("openai"))?;
        if !resp.status().is_success() {
            return Err(ServiceError::BadResponse(format!("openai status {}", resp.status())));
        }
        let parsed: Resp = resp.json().await.map_err(map_reqwest("openai"))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ServiceError::BadResponse("openai: empty completion".into()))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

pub(crate) fn map_reqwest(service: &'static str) -> impl Fn(reqwest::Error) -> ServiceError {
    move |e| {
        if e.is_timeout() {
            ServiceError::Timeout {
                service,
                after: Duration::ZERO,
            }
        } else if e.is_decode() {
            ServiceError::BadResponse(format!("{service}: {e}"))
        } else {
            ServiceError::Unavailable(format!("{service}: {e}"))
        }
    }
}

/// Always unavailable; callers fall back to their local signals.
pub struct DisabledJudge;

#[async_trait]
impl JudgmentModel for DisabledJudge {
    async fn complete(&self, _req: &JudgmentRequest) -> Result<String, ServiceError> {
        Err(ServiceError::Unavailable("judgment model disabled".into()))
    }
    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Deterministic judge for tests and offline runs.
///
/// Default behavior echoes the request hint. A script replaces that with a
/// queue of canned responses (the last one repeats once the queue drains).
pub struct MockJudge {
    script: Mutex<Vec<String>>,
    delay: Option<Duration>,
    fail: bool,
    calls: Mutex<Vec<JudgmentTask>>,
}

impl Default for MockJudge {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJudge {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            delay: None,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut v: Vec<String> = responses.into_iter().map(Into::into).collect();
        v.reverse();
        Self {
            script: Mutex::new(v),
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    /// Tasks seen so far, in call order.
    pub fn calls(&self) -> Vec<JudgmentTask> {
        self.calls.lock().clone()
    }

    fn fallback(task: JudgmentTask) -> &'static str {
        match task {
            JudgmentTask::Region => r#"{"region":"global","confidence":0.5,"rationale":"mock"}"#,
            JudgmentTask::Topics => r#"{"topics":["industry_news"],"confidence":0.5,"rationale":"mock"}"#,
            JudgmentTask::Relevance => r#"{"score":0.5}"#,
            JudgmentTask::Rerank => r#"{"scores":[]}"#,
            JudgmentTask::Answer => r#"{"answer":"","cited":[],"confidence":0.0}"#,
        }
    }
}

#[async_trait]
impl JudgmentModel for MockJudge {
    async fn complete(&self, req: &JudgmentRequest) -> Result<String, ServiceError> {
        self.calls.lock().push(req.task);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.fail {
            return Err(ServiceError::Unavailable("mock failure".into()));
        }
        {
            let mut script = self.script.lock();
            if script.len() > 1 {
                return Ok(script.pop().unwrap_or_default());
            }
            if let Some(last) = script.last() {
                return Ok(last.clone());
            }
        }
        Ok(req
            .hint
            .clone()
            .unwrap_or_else(|| Self::fallback(req.task).to_string()))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/* ----------------------------
Caching wrapper (file cache + daily budget)
---------------------------- */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DailyCounter {
    date: String,
    count: u32,
}

impl DailyCounter {
    fn today() -> String {
        chrono::Utc::now().format("%Y-%m-%d").to_string()
    }

    fn roll(&mut self) {
        let today = Self::today();
        if self.date != today {
            self.date = today;
            self.count = 0;
        }
    }
}

/// Wraps a judge with an on-disk response cache keyed by request hash and a
/// per-day budget on real calls. Cache hits do not count against the budget.
pub struct CachedJudge<J: JudgmentModel> {
    inner: J,
    model: String,
    cache_dir: PathBuf,
    daily_limit: u32,
    counter: Mutex<DailyCounter>,
}

impl<J: JudgmentModel> CachedJudge<J> {
    pub fn new(inner: J, model: impl Into<String>, cache_dir: PathBuf, daily_limit: u32) -> Self {
        if let Err(e) = fs::create_dir_all(&cache_dir) {
            warn!(target: "judge", error = %e, dir = %cache_dir.display(), "cache dir unavailable");
        }
        let counter = read_json::<DailyCounter>(&cache_dir.join("_daily_counter.json")).unwrap_or_default();
        Self {
            inner,
            model: model.into(),
            cache_dir,
            daily_limit,
            counter: Mutex::new(counter),
        }
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.json"))
    }

    fn persist_counter(&self, snapshot: &DailyCounter) {
        if let Err(e) = write_json_atomic(&self.cache_dir.join("_daily_counter.json"), snapshot) {
            warn!(target: "judge", error = %e, count = snapshot.count, "daily counter write failed");
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    task: JudgmentTask,
    response: String,
}

#[async_trait]
impl<J: JudgmentModel> JudgmentModel for CachedJudge<J> {
    async fn complete(&self, req: &JudgmentRequest) -> Result<String, ServiceError> {
        let key = req.cache_key(&self.model);
        if let Some(hit) = read_json::<CacheEntry>(&self.cache_path(&key)) {
            debug!(target: "judge", task = req.task.as_str(), "cache hit");
            return Ok(hit.response);
        }

        // reserve the slot before awaiting so concurrent misses cannot overshoot
        let snapshot = {
            let mut c = self.counter.lock();
            c.roll();
            if c.count >= self.daily_limit {
                return Err(ServiceError::Unavailable("daily judgment budget exhausted".into()));
            }
            c.count = c.count.saturating_add(1);
            c.clone()
        };
        self.persist_counter(&snapshot);

        let response = match self.inner.complete(req).await {
            Ok(r) => r,
            Err(e) => {
                let snapshot = {
                    let mut c = self.counter.lock();
                    if c.date == snapshot.date {
                        c.count = c.count.saturating_sub(1);
                    }
                    c.clone()
                };
                self.persist_counter(&snapshot);
                return Err(e);
            }
        };

        let entry = CacheEntry {
            task: req.task,
            response: response.clone(),
        };
        if let Err(e) = write_json_atomic(&self.cache_path(&key), &entry) {
            warn!(target: "judge", error = %e, "cache write failed");
        }
        Ok(response)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/* ----------------------------
Concurrency + deadline gate
---------------------------- */

/// Bounds simultaneous outstanding external calls and puts a deadline on each.
#[derive(Clone, Debug)]
pub struct ServiceGate {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ServiceGate {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run<T, F>(&self, service: &'static str, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        self.run_with_deadline(service, self.timeout, fut).await
    }

    /// Same as `run` with a caller-supplied deadline (never above the gate's own).
    pub async fn run_with_deadline<T, F>(
        &self,
        service: &'static str,
        deadline: Duration,
        fut: F,
    ) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        let after = deadline.min(self.timeout);
        let permits = &self.permits;
        // waiting for a permit spends the same deadline as the call itself
        let call = async move {
            let _permit = permits
                .acquire()
                .await
                .map_err(|_| ServiceError::Unavailable(format!("{service}: gate closed")))?;
            fut.await
        };
        match tokio::time::timeout(after, call).await {
            Ok(Err(ServiceError::Timeout { .. })) | Err(_) => {
                counter!("triage_external_timeouts_total").increment(1);
                warn!(target: "judge", service, ?after, "external call timed out");
                Err(ServiceError::Timeout { service, after })
            }
            Ok(r) => r,
        }
    }
}

/// Build the configured judgment model.
pub fn build_judge(cfg: &ModelConfig, timeout: Duration) -> DynJudge {
    match cfg.provider {
        ModelProvider::Mock => Arc::new(MockJudge::new()),
        ModelProvider::Disabled => Arc::new(DisabledJudge),
        ModelProvider::Openai => match OpenAiJudge::new(cfg.api_key.clone(), cfg.judge_model.clone(), timeout) {
            Ok(j) => match &cfg.cache_dir {
                Some(dir) => Arc::new(CachedJudge::new(j, cfg.judge_model.clone(), PathBuf::from(dir), cfg.daily_limit)),
                None => Arc::new(j),
            },
            Err(e) => {
                warn!(target: "judge", error = %e, "openai judge unavailable, running without model");
                Arc::new(DisabledJudge)
            }
        },
    }
}

// src/config/model.rs
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

use super::ConfigError;

pub const DEFAULT_MODEL_CONFIG_PATH: &str = "config/model.json";
pub const ENV_MODEL_CONFIG_PATH: &str = "TRIAGE_MODEL_CONFIG_PATH";

fn default_judge_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_daily_limit() -> u32 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Openai,
    Mock,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Directory for the judgment response cache; `None` disables caching.
    #[serde(default)]
    pub cache_dir: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Mock,
            judge_model: default_judge_model(),
            embedding_model: default_embedding_model(),
            api_key: String::new(),
            daily_limit: default_daily_limit(),
            cache_dir: None,
        }
    }
}

impl ModelConfig {
    /// `TRIAGE_MODEL_CONFIG_PATH` or `config/model.json`; a missing default file
    /// yields the mock provider.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(ENV_MODEL_CONFIG_PATH)
            .unwrap_or_else(|_| DEFAULT_MODEL_CONFIG_PATH.to_string());
        let path = Path::new(&path);
        if !path.exists() && env::var(ENV_MODEL_CONFIG_PATH).is_err() {
            return Ok(Self::default().with_test_mode());
        }
        Self::load_from_file(path)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: ModelConfig = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        cfg.resolve()
    }

    /// Apply `AI_TEST_MODE` and resolve an `"ENV"` api key.
    pub fn resolve(self) -> Result<Self, ConfigError> {
        let mut cfg = self.with_test_mode();
        if cfg.provider == ModelProvider::Openai && cfg.api_key.trim().eq_ignore_ascii_case("env") {
            cfg.api_key =
                env::var("OPENAI_API_KEY").map_err(|_| ConfigError::Missing("OPENAI_API_KEY"))?;
        }
        if cfg.daily_limit == 0 {
            cfg.daily_limit = default_daily_limit();
        }
        Ok(cfg)
    }

    fn with_test_mode(mut self) -> Self {
        if env::var("AI_TEST_MODE").ok().as_deref() == Some("mock") {
            self.provider = ModelProvider::Mock;
        }
        self
    }
}

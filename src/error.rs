// src/error.rs
//! Error taxonomy shared by the pipeline stages.
//!
//! Per-article errors (`MalformedInputError`, `ClassificationError`,
//! `ServiceError`) are isolated by the batch runner. Only `PipelineError`
//! aborts a batch.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// A raw document could not be turned into an `Article`.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
#[error("malformed input ({field}): {reason}")]
pub struct MalformedInputError {
    pub field: &'static str,
    pub reason: String,
    /// URL of the offending record when one was supplied.
    pub url: Option<String>,
}

impl MalformedInputError {
    pub fn missing(field: &'static str, url: Option<String>) -> Self {
        Self {
            field,
            reason: "missing or empty".into(),
            url,
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>, url: Option<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
            url,
        }
    }
}

/// Model output that fails schema validation against the closed taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("invalid {kind} label `{value}`")]
    InvalidLabel { kind: &'static str, value: String },
    #[error("topics must be a non-empty set")]
    EmptyTopics,
    #[error("unparseable model output: {0}")]
    Unparseable(String),
}

/// Failure of an external judgment or embedding call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// ExternalServiceTimeout: the call exceeded its deadline.
    #[error("{service} call timed out after {after:?}")]
    Timeout {
        service: &'static str,
        after: Duration,
    },
    #[error("{0} unavailable")]
    Unavailable(String),
    #[error("bad response: {0}")]
    BadResponse(String),
}

impl ServiceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ServiceError::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store unreachable: {0}")]
    Unreachable(String),
}

/// Two writers disagreed on the content stored under one id.
/// Never returned to callers: last write wins and the anomaly is logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("write conflict on article {id}")]
pub struct StoreWriteConflict {
    pub id: String,
}

/// Failures that abort a whole batch. Nothing is committed when one is raised.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("configuration failure: {0}")]
    Config(#[from] ConfigError),
}

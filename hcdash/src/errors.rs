//! Error types for hcdash

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::fsm::Stage;
use crate::deploy::job::StepName;

/// Main error type for the control plane process
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Service error: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure reported by (or while talking to) an external collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ServiceError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Connectivity(_) => "connectivity",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Rejected(_) => "rejected",
            ServiceError::InvalidResponse(_) => "invalid_response",
            ServiceError::Timeout(_) => "timeout",
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Connectivity(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ServiceError::InvalidResponse(err.to_string())
        } else if err.is_status() {
            ServiceError::Rejected(err.to_string())
        } else {
            ServiceError::Connectivity(err.to_string())
        }
    }
}

/// Classification of a job failure, as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// A collaborator call failed or returned something unusable
    Collaborator,

    /// The generated manifest violated the security policy
    Policy,

    /// The job or one of its calls ran out of time
    Timeout,

    /// The job was cancelled on request
    Cancelled,

    /// An internal invariant was broken
    Internal,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobErrorKind::Collaborator => "collaborator",
            JobErrorKind::Policy => "policy",
            JobErrorKind::Timeout => "timeout",
            JobErrorKind::Cancelled => "cancelled",
            JobErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Classified failure attached to a job and published to observers
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} error during {stage}: {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    /// Stage the job was in when the failure happened
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepName>,
    /// Collaborator error code, when the failure came from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            step: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_step(mut self, step: StepName) -> Self {
        self.step = Some(step);
        self
    }

    /// Classify a collaborator failure; a collaborator timeout stays a timeout
    pub fn from_service(stage: Stage, err: &ServiceError) -> Self {
        let kind = match err {
            ServiceError::Timeout(_) => JobErrorKind::Timeout,
            _ => JobErrorKind::Collaborator,
        };
        Self {
            kind,
            stage,
            step: None,
            code: Some(err.code().to_string()),
            message: err.to_string(),
        }
    }

    pub fn timeout(stage: Stage, limit: Duration) -> Self {
        Self::new(
            JobErrorKind::Timeout,
            stage,
            format!("job exceeded its {:?} deadline", limit),
        )
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self::new(JobErrorKind::Cancelled, stage, "cancelled on request")
    }
}

//! Deployment job model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::Stage;
use crate::errors::JobError;

/// Opaque job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(crate::utils::generate_uuid())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a container is being rolled out to; at most one active job per target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeployTarget {
    pub container: String,
    pub cluster: String,
    pub namespace: String,
}

impl DeployTarget {
    pub fn new(
        container: impl Into<String>,
        cluster: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            container: container.into(),
            cluster: cluster.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}/{}", self.container, self.cluster, self.namespace)
    }
}

/// Rollout step, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    PushImage,
    CreateDeployment,
    CreateService,
}

impl StepName {
    pub const ORDER: [StepName; 3] = [
        StepName::PushImage,
        StepName::CreateDeployment,
        StepName::CreateService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::PushImage => "push_image",
            StepName::CreateDeployment => "create_deployment",
            StepName::CreateService => "create_service",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployStep {
    pub name: StepName,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeployStep {
    pub fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Success,
    Failure,
    Cancelled,
}

impl JobResult {
    pub fn from_stage(stage: Stage) -> Option<Self> {
        match stage {
            Stage::Succeeded => Some(JobResult::Success),
            Stage::Failed => Some(JobResult::Failure),
            Stage::Cancelled => Some(JobResult::Cancelled),
            _ => None,
        }
    }
}

/// Generated Kubernetes documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Deployment document (YAML)
    pub deployment: String,

    /// Service document (YAML)
    pub service: String,

    /// Free-form notes returned by the generator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Point-in-time view of a job, published after every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub deploy_id: JobId,
    pub target: DeployTarget,
    pub stage: Stage,
    /// Bumped on every transition
    #[serde(default)]
    pub revision: u64,
    pub steps: Vec<DeployStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    /// Number of similar past deployments used as context
    #[serde(default)]
    pub similar_deployments: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn submitted(deploy_id: JobId, target: DeployTarget) -> Self {
        let now = Utc::now();
        Self {
            deploy_id,
            target,
            stage: Stage::Submitted,
            revision: 0,
            steps: StepName::ORDER.iter().copied().map(DeployStep::pending).collect(),
            result: None,
            error: None,
            image: None,
            manifest: None,
            similar_deployments: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, name: StepName) -> Option<&DeployStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: StepName) -> Option<&mut DeployStep> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Share of finished steps, 0..=100
    pub fn progress(&self) -> u8 {
        if self.stage == Stage::Succeeded {
            return 100;
        }
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count();
        let base = match self.stage {
            Stage::Submitted => 0,
            Stage::Analyzing => 10,
            Stage::ManifestReady => 25,
            _ => 40,
        };
        let per_step = 60 / self.steps.len().max(1);
        (base + done * per_step).min(100) as u8
    }
}

//! Messages carried by the hub and streamed to observers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::Stage;
use crate::deploy::job::{JobId, JobSnapshot, StepName, StepStatus};
use crate::errors::JobError;
use crate::hub::Hub;
use crate::telemetry::{ClusterMetricsSnapshot, DockerStatsSnapshot};

/// Hub carrying every live-update channel
pub type EventHub = Hub<Event>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    DeployStatus(DeployStatusEvent),
    DockerStats(DockerStatsSnapshot),
    K8sMetrics(ClusterMetricsSnapshot),
    Log(LogLine),
}

/// One deployment transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployStatusEvent {
    pub deploy_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub revision: u64,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_status: Option<StepStatus>,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl DeployStatusEvent {
    /// Build from the snapshot the transition just produced
    pub fn from_snapshot(snapshot: &JobSnapshot, step: Option<StepName>, message: String) -> Self {
        let step_status = step.and_then(|name| snapshot.step(name)).map(|s| s.status);
        Self {
            deploy_id: snapshot.deploy_id.clone(),
            timestamp: snapshot.updated_at,
            revision: snapshot.revision,
            stage: snapshot.stage,
            step,
            step_status,
            progress: snapshot.progress(),
            message,
            error: snapshot.error.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// One line from a log tail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// What goes over the wire: the event plus the subscriber's drop counter
#[derive(Debug, Serialize)]
pub struct StreamFrame<'a> {
    pub dropped: u64,
    #[serde(flatten)]
    pub event: &'a Event,
}

/// Final frame after the terminal sentinel
#[derive(Debug, Serialize)]
pub struct ClosedFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub topic: String,
    pub dropped: u64,
}

impl ClosedFrame {
    pub fn new(topic: &str, dropped: u64) -> Self {
        Self {
            kind: "closed",
            topic: topic.to_string(),
            dropped,
        }
    }
}

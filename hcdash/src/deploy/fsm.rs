//! Finite state machine for a deployment job

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deployment stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Admitted, not started yet
    Submitted,

    /// Inspecting the container and looking up similar deployments
    Analyzing,

    /// Generating and validating the manifest
    ManifestReady,

    /// Running the rollout steps
    Deploying,

    /// All steps succeeded
    Succeeded,

    /// Stopped on an error
    Failed,

    /// Stopped on request
    Cancelled,
}

impl Stage {
    /// Position in the forward order; terminal stages share the last rank
    pub fn ordinal(&self) -> u8 {
        match self {
            Stage::Submitted => 0,
            Stage::Analyzing => 1,
            Stage::ManifestReady => 2,
            Stage::Deploying => 3,
            Stage::Succeeded | Stage::Failed | Stage::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed | Stage::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Submitted => "submitted",
            Stage::Analyzing => "analyzing",
            Stage::ManifestReady => "manifest_ready",
            Stage::Deploying => "deploying",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage machine event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    /// Start inspecting the container
    Analyze,

    /// Analysis done, generate the manifest
    GenerateManifest,

    /// Manifest accepted, start the rollout
    Deploy,

    /// Every step succeeded
    Complete,

    /// A stage failed (error, policy violation or timeout)
    Fail,

    /// Cancellation observed at a boundary
    Cancel,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition: {from} on {event:?}")]
pub struct TransitionError {
    pub from: Stage,
    pub event: StageEvent,
}

/// Deployment stage machine
#[derive(Debug, Clone)]
pub struct StageMachine {
    stage: Stage,
}

impl StageMachine {
    pub fn new() -> Self {
        Self {
            stage: Stage::Submitted,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: StageEvent) -> Result<Stage, TransitionError> {
        let next = match (self.stage, event) {
            (Stage::Submitted, StageEvent::Analyze) => Stage::Analyzing,
            (Stage::Analyzing, StageEvent::GenerateManifest) => Stage::ManifestReady,
            (Stage::ManifestReady, StageEvent::Deploy) => Stage::Deploying,
            (Stage::Deploying, StageEvent::Complete) => Stage::Succeeded,

            // Timeouts may land while still submitted
            (stage, StageEvent::Fail) if !stage.is_terminal() => Stage::Failed,
            (stage, StageEvent::Cancel) if !stage.is_terminal() => Stage::Cancelled,

            (from, event) => return Err(TransitionError { from, event }),
        };

        self.stage = next;
        Ok(next)
    }
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}

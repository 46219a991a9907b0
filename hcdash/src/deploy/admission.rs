//! Admission control and the registry of active jobs
//!
//! A job holds an [`AdmissionTicket`] for as long as it runs. The ticket owns
//! the job's capacity slot and its target reservation; dropping it (normally
//! or while unwinding) gives both back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::deploy::job::{DeployTarget, JobId, JobSnapshot};

/// Admission options
#[derive(Debug, Clone)]
pub struct AdmissionOptions {
    /// Maximum number of jobs running at once
    pub max_active: usize,
}

impl Default for AdmissionOptions {
    fn default() -> Self {
        Self { max_active: 5 }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("deployment {existing} is already running for {target}")]
    DuplicateTarget {
        existing: JobId,
        target: DeployTarget,
    },

    #[error("too many active deployments (limit {limit})")]
    CapacityExceeded { limit: usize },
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::DuplicateTarget { .. } => "duplicate_target",
            AdmissionError::CapacityExceeded { .. } => "capacity_exceeded",
        }
    }
}

struct ActiveJob {
    target: DeployTarget,
    status: watch::Receiver<JobSnapshot>,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<JobId, ActiveJob>,
    targets: HashMap<DeployTarget, JobId>,
}

/// Bounded set of running jobs, keyed by id and by target
pub struct AdmissionController {
    options: AdmissionOptions,
    registry: Mutex<Registry>,
}

impl AdmissionController {
    pub fn new(options: AdmissionOptions) -> Self {
        Self {
            options,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limit(&self) -> usize {
        self.options.max_active
    }

    /// Reserve a slot for a new job on `target`
    pub fn admit(
        self: &Arc<Self>,
        target: DeployTarget,
    ) -> Result<AdmissionTicket, AdmissionError> {
        self.admit_as(JobId::generate(), target)
    }

    fn admit_as(
        self: &Arc<Self>,
        job_id: JobId,
        target: DeployTarget,
    ) -> Result<AdmissionTicket, AdmissionError> {
        let mut registry = self.lock();

        if let Some(existing) = registry.targets.get(&target) {
            return Err(AdmissionError::DuplicateTarget {
                existing: existing.clone(),
                target,
            });
        }
        if registry.jobs.len() >= self.options.max_active {
            return Err(AdmissionError::CapacityExceeded {
                limit: self.options.max_active,
            });
        }
        assert!(
            !registry.jobs.contains_key(&job_id),
            "job id {} admitted twice",
            job_id
        );

        let snapshot = JobSnapshot::submitted(job_id.clone(), target.clone());
        let (status_tx, status_rx) = watch::channel(snapshot);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        registry.targets.insert(target.clone(), job_id.clone());
        registry.jobs.insert(
            job_id.clone(),
            ActiveJob {
                target: target.clone(),
                status: status_rx,
                cancel: cancel_tx,
            },
        );
        info!(
            "Admitted deployment {} for {} ({}/{} active)",
            job_id,
            target,
            registry.jobs.len(),
            self.options.max_active
        );

        Ok(AdmissionTicket {
            controller: self.clone(),
            job_id,
            target,
            status: status_tx,
            cancel: cancel_rx,
        })
    }

    /// Latest snapshot of an active job
    pub fn status(&self, job_id: &JobId) -> Option<JobSnapshot> {
        let registry = self.lock();
        registry
            .jobs
            .get(job_id)
            .map(|job| job.status.borrow().clone())
    }

    /// Request cancellation. Returns false if the job is not active.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let registry = self.lock();
        match registry.jobs.get(job_id) {
            Some(job) => {
                job.cancel.send_replace(true);
                info!("Cancellation requested for deployment {}", job_id);
                true
            }
            None => false,
        }
    }

    /// Request cancellation of every active job
    pub fn cancel_all(&self) -> usize {
        let registry = self.lock();
        for job in registry.jobs.values() {
            job.cancel.send_replace(true);
        }
        registry.jobs.len()
    }

    pub fn active_count(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Snapshots of every active job, oldest first
    pub fn active_jobs(&self) -> Vec<JobSnapshot> {
        let registry = self.lock();
        let mut jobs: Vec<JobSnapshot> = registry
            .jobs
            .values()
            .map(|job| job.status.borrow().clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    fn release(&self, job_id: &JobId) {
        let mut registry = self.lock();
        if let Some(job) = registry.jobs.remove(job_id) {
            if registry.targets.get(&job.target) == Some(job_id) {
                registry.targets.remove(&job.target);
            }
            debug!(
                "Released deployment {} ({} active)",
                job_id,
                registry.jobs.len()
            );
        }
    }
}

/// Capacity slot and status channel of one running job
pub struct AdmissionTicket {
    controller: Arc<AdmissionController>,
    job_id: JobId,
    target: DeployTarget,
    status: watch::Sender<JobSnapshot>,
    cancel: watch::Receiver<bool>,
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("job_id", &self.job_id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl AdmissionTicket {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn target(&self) -> &DeployTarget {
        &self.target
    }

    /// Make `snapshot` the answer to status queries
    pub fn update(&self, snapshot: JobSnapshot) {
        self.status.send_replace(snapshot);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.controller.release(&self.job_id);
    }
}

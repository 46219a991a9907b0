//! Deployment orchestrator
//!
//! Admits jobs, drives each one through the stage machine on its own task
//! and publishes every transition to `deploy:<job-id>`. Active jobs are read
//! through their admission ticket; finished ones come from the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::deploy::admission::{
    AdmissionController, AdmissionError, AdmissionOptions, AdmissionTicket,
};
use crate::deploy::fsm::{Stage, StageEvent, StageMachine};
use crate::deploy::job::{
    DeployTarget, JobId, JobResult, JobSnapshot, Manifest, StepName, StepStatus,
};
use crate::deploy::policy::{validate_manifest, SecurityPolicy};
use crate::errors::{JobError, JobErrorKind, ServiceError};
use crate::events::{DeployStatusEvent, Event, EventHub};
use crate::hub::topics::Topics;
use crate::hub::{Publisher, Subscription};
use crate::services::ai::ManifestRequest;
use crate::services::docker::ContainerInfo;
use crate::services::registry::target_image;
use crate::services::store::DeploymentRecord;
use crate::services::{with_timeout, Services};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Wall-clock limit for a whole job
    pub job_timeout: Duration,

    /// Limit for each collaborator call
    pub call_timeout: Duration,

    /// Similar past deployments handed to the generator
    pub similar_limit: usize,

    pub admission: AdmissionOptions,

    pub policy: SecurityPolicy,

    /// Attempts at recording a finished job before giving up
    pub record_attempts: u32,

    pub record_cooldown: CooldownOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            similar_limit: 5,
            admission: AdmissionOptions::default(),
            policy: SecurityPolicy::default(),
            record_attempts: 5,
            record_cooldown: CooldownOptions::default(),
        }
    }
}

/// Accepted submission
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub deploy_id: JobId,
    pub stage: Stage,
    pub topic: String,
}

/// How to follow a job
pub enum Watch {
    /// Still running: the snapshot taken after subscribing, then every later event
    Live {
        snapshot: JobSnapshot,
        subscription: Subscription<Event>,
    },
    /// Already finished
    Finished(JobSnapshot),
}

/// A finished job the store has not accepted yet
struct PendingRecord {
    snapshot: JobSnapshot,

    /// Its own runner gave up; the next successful write retries it
    abandoned: bool,
}

/// Finished jobs not yet in the store, so status queries still resolve
type PendingRecords = Arc<Mutex<HashMap<JobId, PendingRecord>>>;

fn lock_pending(pending: &PendingRecords) -> MutexGuard<'_, HashMap<JobId, PendingRecord>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Orchestrator {
    services: Services,
    hub: EventHub,
    admission: Arc<AdmissionController>,
    options: Arc<OrchestratorOptions>,
    tasks: Mutex<JoinSet<()>>,
    pending: PendingRecords,
}

impl Orchestrator {
    pub fn new(services: Services, hub: EventHub, options: OrchestratorOptions) -> Self {
        Self {
            admission: Arc::new(AdmissionController::new(options.admission.clone())),
            services,
            hub,
            options: Arc::new(options),
            tasks: Mutex::new(JoinSet::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Admit a job and start driving it
    pub fn submit(&self, target: DeployTarget) -> Result<Submission, AdmissionError> {
        let ticket = self.admission.admit(target)?;
        let deploy_id = ticket.job_id().clone();
        let topic = Topics::deploy(deploy_id.as_str());
        let publisher = self.hub.publisher(&topic);

        let runner = JobRunner {
            services: self.services.clone(),
            options: self.options.clone(),
            pending: self.pending.clone(),
            snapshot: JobSnapshot::submitted(deploy_id.clone(), ticket.target().clone()),
            fsm: StageMachine::new(),
            ticket,
            publisher,
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(finished) = tasks.try_join_next() {
            log_join(finished);
        }
        tasks.spawn(runner.run());

        Ok(Submission {
            deploy_id,
            stage: Stage::Submitted,
            topic,
        })
    }

    /// Current snapshot of a job, active or finished
    pub async fn status(&self, id: &JobId) -> Result<Option<JobSnapshot>, ServiceError> {
        if let Some(snapshot) = self.admission.status(id) {
            return Ok(Some(snapshot));
        }
        if let Some(snapshot) = self.pending_snapshot(id) {
            return Ok(Some(snapshot));
        }
        let record = with_timeout(
            self.options.call_timeout,
            self.services.store.get_deployment(id),
        )
        .await?;
        Ok(record.map(|r| r.to_snapshot()))
    }

    /// Subscribe to a job's topic together with a consistent starting snapshot
    pub async fn watch(&self, id: &JobId) -> Result<Option<Watch>, ServiceError> {
        let subscription = self.hub.subscribe(&Topics::deploy(id.as_str()));
        if let Some(snapshot) = self.admission.status(id) {
            return Ok(Some(Watch::Live {
                snapshot,
                subscription,
            }));
        }
        drop(subscription);
        Ok(self.status(id).await?.map(Watch::Finished))
    }

    /// Request cooperative cancellation. Returns false if the job is not active.
    pub fn cancel(&self, id: &JobId) -> bool {
        self.admission.cancel(id)
    }

    /// Past deployments, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<DeploymentRecord>, ServiceError> {
        with_timeout(
            self.options.call_timeout,
            self.services.store.get_deploy_history(limit),
        )
        .await
    }

    pub fn active(&self) -> Vec<JobSnapshot> {
        self.admission.active_jobs()
    }

    pub fn active_count(&self) -> usize {
        self.admission.active_count()
    }

    /// Finished jobs still waiting for the store
    pub fn pending_records(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    fn pending_snapshot(&self, id: &JobId) -> Option<JobSnapshot> {
        lock_pending(&self.pending)
            .get(id)
            .map(|p| p.snapshot.clone())
    }

    /// Cancel every active job and wait up to `grace` for them to finish
    pub async fn shutdown(&self, grace: Duration) {
        let cancelled = self.admission.cancel_all();
        let mut tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        info!(
            "Shutting down orchestrator ({} active jobs cancelled)",
            cancelled
        );

        let drained = tokio::time::timeout(grace, async {
            while let Some(finished) = tasks.join_next().await {
                log_join(finished);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} deployment jobs still running after {:?}, aborting",
                tasks.len(),
                grace
            );
            tasks.abort_all();
        }
    }
}

fn log_join(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!("Deployment task panicked: {}", e);
        }
    }
}

/// Owns one job from admission to its store record
struct JobRunner {
    services: Services,
    options: Arc<OrchestratorOptions>,
    pending: PendingRecords,
    ticket: AdmissionTicket,
    publisher: Publisher<Event>,
    fsm: StageMachine,
    snapshot: JobSnapshot,
}

impl JobRunner {
    async fn run(mut self) {
        let id = self.snapshot.deploy_id.clone();
        info!("Starting deployment {} ({})", id, self.snapshot.target);

        let limit = self.options.job_timeout;
        let outcome = match tokio::time::timeout(limit, self.drive()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::timeout(self.fsm.stage(), limit)),
        };

        if let Err(err) = outcome {
            self.finish_with_error(err);
        }

        match self.snapshot.stage {
            Stage::Succeeded => info!("Deployment {} succeeded", id),
            Stage::Cancelled => info!("Deployment {} cancelled", id),
            stage => warn!(
                "Deployment {} ended {}: {}",
                id,
                stage,
                self.snapshot
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            ),
        }

        let JobRunner {
            services,
            options,
            pending,
            ticket,
            publisher,
            snapshot,
            ..
        } = self;

        // Status must resolve through the pending map before the slot goes
        let record = DeploymentRecord::from_snapshot(&snapshot);
        if record.is_some() {
            lock_pending(&pending).insert(
                id.clone(),
                PendingRecord {
                    snapshot,
                    abandoned: false,
                },
            );
        } else {
            error!(
                "Deployment {} is not terminal ({}), not recording",
                id, snapshot.stage
            );
        }
        drop(ticket);
        publisher.close();

        if let Some(record) = record {
            let recorder = Recorder {
                services,
                options,
                pending,
            };
            if recorder.record(&record).await {
                recorder.retry_abandoned().await;
            }
        }
    }

    async fn drive(&mut self) -> Result<(), JobError> {
        let call_timeout = self.options.call_timeout;
        let target = self.snapshot.target.clone();

        // analyzing
        self.checkpoint()?;
        self.transition(StageEvent::Analyze, "analyzing container")?;

        let cluster = self
            .services
            .kubernetes
            .list_clusters()
            .into_iter()
            .find(|c| c.name == target.cluster)
            .ok_or_else(|| {
                JobError::from_service(
                    Stage::Analyzing,
                    &ServiceError::NotFound(format!("cluster {} is not configured", target.cluster)),
                )
            })?;

        let info = with_timeout(
            call_timeout,
            self.services.docker.get_container(&target.container),
        )
        .await
        .map_err(|e| JobError::from_service(Stage::Analyzing, &e))?;

        let source_image = info.image_ref();
        let image = target_image(cluster.registry.as_deref(), &info.image, &info.tag);
        self.snapshot.image = Some(source_image.clone());

        let history = self.similar(&info).await;
        self.snapshot.similar_deployments = history.len();

        // manifest_ready
        self.checkpoint()?;
        self.transition(StageEvent::GenerateManifest, "generating manifest")?;

        let request = ManifestRequest {
            container: info,
            image: image.clone(),
            namespace: target.namespace.clone(),
            history,
        };
        let manifest = with_timeout(call_timeout, self.services.ai.generate_manifest(&request))
            .await
            .map_err(|e| JobError::from_service(Stage::ManifestReady, &e))?;
        self.check_manifest(&manifest)?;
        self.snapshot.manifest = Some(manifest.clone());

        // deploying
        self.checkpoint()?;
        self.transition(StageEvent::Deploy, "deploying")?;

        for step in StepName::ORDER {
            self.checkpoint()?;
            self.start_step(step);

            let result = match step {
                StepName::PushImage => {
                    with_timeout(
                        call_timeout,
                        self.services.registry.push_image(&source_image, &image),
                    )
                    .await
                }
                StepName::CreateDeployment => with_timeout(
                    call_timeout,
                    self.services.kubernetes.apply_manifest(
                        &target.cluster,
                        &target.namespace,
                        &manifest.deployment,
                    ),
                )
                .await
                .map(|out| debug!("{}", out.trim())),
                StepName::CreateService => with_timeout(
                    call_timeout,
                    self.services.kubernetes.apply_manifest(
                        &target.cluster,
                        &target.namespace,
                        &manifest.service,
                    ),
                )
                .await
                .map(|out| debug!("{}", out.trim())),
            };

            match result {
                Ok(()) => self.finish_step(step, None),
                Err(e) => {
                    let err = JobError::from_service(Stage::Deploying, &e).with_step(step);
                    self.finish_step(step, Some(err.clone()));
                    return Err(err);
                }
            }
        }

        self.transition(StageEvent::Complete, "deployment succeeded")?;
        Ok(())
    }

    /// Best effort: a failing lookup only means less context
    async fn similar(&self, info: &ContainerInfo) -> Vec<DeploymentRecord> {
        let lookup = with_timeout(
            self.options.call_timeout,
            self.services
                .store
                .find_similar(info, self.options.similar_limit),
        )
        .await;
        match lookup {
            Ok(history) => {
                debug!(
                    "Found {} similar deployments for {}",
                    history.len(),
                    info.name
                );
                history
            }
            Err(e) => {
                warn!("Similar deployment lookup failed, continuing without: {}", e);
                Vec::new()
            }
        }
    }

    fn check_manifest(&self, manifest: &Manifest) -> Result<(), JobError> {
        validate_manifest(manifest, &self.options.policy).map_err(|e| {
            let kind = if e.is_policy() {
                JobErrorKind::Policy
            } else {
                JobErrorKind::Collaborator
            };
            JobError::new(kind, Stage::ManifestReady, e.to_string())
        })
    }

    fn checkpoint(&self) -> Result<(), JobError> {
        if self.ticket.is_cancelled() {
            Err(JobError::cancelled(self.fsm.stage()))
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, event: StageEvent, message: &str) -> Result<(), JobError> {
        let stage = self.fsm.process(event).map_err(|e| {
            error!("Deployment {}: {}", self.snapshot.deploy_id, e);
            JobError::new(JobErrorKind::Internal, e.from, e.to_string())
        })?;
        self.snapshot.stage = stage;
        self.snapshot.result = JobResult::from_stage(stage);
        self.emit(None, message.to_string());
        Ok(())
    }

    fn start_step(&mut self, step: StepName) {
        if let Some(s) = self.snapshot.step_mut(step) {
            s.status = StepStatus::Running;
            s.started_at = Some(Utc::now());
        }
        self.emit(Some(step), format!("{} started", step));
    }

    fn finish_step(&mut self, step: StepName, error: Option<JobError>) {
        let message = match &error {
            None => format!("{} succeeded", step),
            Some(e) => format!("{} failed: {}", step, e.message),
        };
        if let Some(s) = self.snapshot.step_mut(step) {
            s.status = if error.is_some() {
                StepStatus::Failed
            } else {
                StepStatus::Succeeded
            };
            s.error = error;
            s.finished_at = Some(Utc::now());
        }
        self.emit(Some(step), message);
    }

    /// Fail or cancel from wherever the job stopped
    fn finish_with_error(&mut self, err: JobError) {
        // A step cut off by the job deadline
        let running: Vec<StepName> = self
            .snapshot
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .map(|s| s.name)
            .collect();
        for step in running {
            self.finish_step(step, Some(err.clone().with_step(step)));
        }

        let (event, message) = if err.kind == JobErrorKind::Cancelled {
            (StageEvent::Cancel, "deployment cancelled".to_string())
        } else {
            (StageEvent::Fail, format!("deployment failed: {}", err.message))
        };
        self.snapshot.error = Some(err);

        if let Err(e) = self.fsm.process(event) {
            error!("Deployment {}: {}", self.snapshot.deploy_id, e);
            return;
        }
        self.snapshot.stage = self.fsm.stage();
        self.snapshot.result = JobResult::from_stage(self.snapshot.stage);
        self.emit(None, message);
    }

    fn emit(&mut self, step: Option<StepName>, message: String) {
        self.snapshot.revision += 1;
        self.snapshot.updated_at = Utc::now();
        self.ticket.update(self.snapshot.clone());

        let event = DeployStatusEvent::from_snapshot(&self.snapshot, step, message);
        debug!(
            "Deployment {} -> {} (rev {})",
            event.deploy_id, event.stage, event.revision
        );
        self.publisher.publish(Event::DeployStatus(event));
    }
}

/// Writes finished jobs to the store
struct Recorder {
    services: Services,
    options: Arc<OrchestratorOptions>,
    pending: PendingRecords,
}

impl Recorder {
    async fn write(&self, record: &DeploymentRecord) -> Result<(), ServiceError> {
        with_timeout(
            self.options.call_timeout,
            self.services.store.record_deployment(record),
        )
        .await?;
        lock_pending(&self.pending).remove(&record.id);
        Ok(())
    }

    /// Persist with backoff. Returns false once attempts run out.
    async fn record(&self, record: &DeploymentRecord) -> bool {
        let attempts = self.options.record_attempts.max(1);
        for attempt in 0..attempts {
            match self.write(record).await {
                Ok(()) => return true,
                Err(e) if attempt + 1 < attempts => {
                    let delay = calc_exp_backoff(&self.options.record_cooldown, attempt);
                    warn!(
                        "Failed to record deployment {} (attempt {}/{}), retrying in {:?}: {}",
                        record.id,
                        attempt + 1,
                        attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "Giving up recording deployment {} after {} attempts: {}",
                        record.id, attempts, e
                    );
                    if let Some(entry) = lock_pending(&self.pending).get_mut(&record.id) {
                        entry.abandoned = true;
                    }
                }
            }
        }
        false
    }

    /// One more attempt for every record a previous runner gave up on
    async fn retry_abandoned(&self) {
        let claimed: Vec<DeploymentRecord> = {
            let mut pending = lock_pending(&self.pending);
            pending
                .values_mut()
                .filter(|p| p.abandoned)
                .filter_map(|p| {
                    p.abandoned = false;
                    DeploymentRecord::from_snapshot(&p.snapshot)
                })
                .collect()
        };

        let mut failed = Vec::new();
        for record in claimed {
            if !failed.is_empty() {
                failed.push(record.id);
                continue;
            }
            match self.write(&record).await {
                Ok(()) => info!("Recorded deployment {} on retry", record.id),
                Err(e) => {
                    warn!("Store still refuses deployment {}: {}", record.id, e);
                    failed.push(record.id);
                }
            }
        }

        let mut pending = lock_pending(&self.pending);
        for id in failed {
            if let Some(entry) = pending.get_mut(&id) {
                entry.abandoned = true;
            }
        }
    }
}

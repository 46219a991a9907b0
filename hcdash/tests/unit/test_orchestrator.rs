//! Orchestrator scenarios, driven against the in-memory collaborators

use std::time::Duration;

use hcdash::deploy::admission::{AdmissionError, AdmissionOptions};
use hcdash::deploy::fsm::Stage;
use hcdash::deploy::job::{DeployTarget, Manifest, StepName, StepStatus};
use hcdash::deploy::orchestrator::{Orchestrator, OrchestratorOptions, Watch};
use hcdash::errors::{JobErrorKind, ServiceError};
use hcdash::events::{DeployStatusEvent, Event, EventHub};
use hcdash::hub::{Delivery, HubOptions, Subscription};
use hcdash::services::fake::{container, Fault};
use hcdash::services::FakeServices;

const SERVICE_YAML: &str = "apiVersion: v1
kind: Service
metadata:
  name: web-1
spec:
  selector:
    app: web-1
  ports:
  - port: 80
";

const HOST_NETWORK_DEPLOYMENT: &str = "apiVersion: apps/v1
kind: Deployment
metadata:
  name: web-1
spec:
  replicas: 1
  template:
    spec:
      hostNetwork: true
      containers:
      - name: web-1
        image: nginx:1.25
";

struct Harness {
    fakes: FakeServices,
    hub: EventHub,
    orchestrator: Orchestrator,
}

fn harness(options: OrchestratorOptions) -> Harness {
    let fakes = FakeServices::new(&["prod"]);
    for name in ["web-1", "web-2", "web-3", "web-4", "web-5", "web-6", "web-7"] {
        fakes.docker.insert(container(name, "nginx", "1.25"));
    }
    let hub = EventHub::new(HubOptions::default());
    let orchestrator = Orchestrator::new(fakes.services(), hub.clone(), options);
    Harness {
        fakes,
        hub,
        orchestrator,
    }
}

fn target(container: &str) -> DeployTarget {
    DeployTarget::new(container, "prod", "default")
}

/// Every status event until the topic closes
async fn collect(subscription: &Subscription<Event>) -> Vec<DeployStatusEvent> {
    let mut events = Vec::new();
    while let Delivery::Message(event) = subscription.recv().await {
        if let Event::DeployStatus(status) = event.as_ref() {
            events.push(status.clone());
        }
    }
    events
}

fn stages(events: &[DeployStatusEvent]) -> Vec<Stage> {
    let mut stages: Vec<Stage> = events.iter().map(|e| e.stage).collect();
    stages.dedup();
    stages
}

async fn wait_for_release(orchestrator: &Orchestrator, active: usize) {
    while orchestrator.active_count() > active {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_scenario_a_submit_then_analyzing() {
    let h = harness(OrchestratorOptions::default());

    let submission = h.orchestrator.submit(target("web-1")).unwrap();
    assert_eq!(submission.stage, Stage::Submitted);
    assert_eq!(submission.topic, format!("deploy:{}", submission.deploy_id));

    // The job task has not run yet on this thread
    let status = h.orchestrator.status(&submission.deploy_id).await.unwrap().unwrap();
    assert_eq!(status.stage, Stage::Submitted);

    let subscription = h.hub.subscribe(&submission.topic);
    let first = match subscription.recv().await {
        Delivery::Message(event) => event,
        Delivery::Closed => panic!("closed before the first event"),
    };
    match first.as_ref() {
        Event::DeployStatus(status) => {
            assert_eq!(status.deploy_id, submission.deploy_id);
            assert_eq!(status.stage, Stage::Analyzing);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_scenario_b_duplicate_target_returns_existing_id() {
    let h = harness(OrchestratorOptions::default());

    let first = h.orchestrator.submit(target("web-1")).unwrap();
    let err = h.orchestrator.submit(target("web-1")).unwrap_err();
    assert_eq!(
        err,
        AdmissionError::DuplicateTarget {
            existing: first.deploy_id.clone(),
            target: target("web-1"),
        }
    );
    assert_eq!(h.orchestrator.active_count(), 1);

    // Once the first job is done the target is free again
    let subscription = h.hub.subscribe(&first.topic);
    collect(&subscription).await;
    wait_for_release(&h.orchestrator, 0).await;
    assert!(h.orchestrator.submit(target("web-1")).is_ok());
}

#[tokio::test]
async fn test_scenario_c_policy_violation_fails_before_rollout() {
    let h = harness(OrchestratorOptions::default());
    h.fakes.ai.set_manifest(Manifest {
        deployment: HOST_NETWORK_DEPLOYMENT.to_string(),
        service: SERVICE_YAML.to_string(),
        notes: None,
    });

    let submission = h.orchestrator.submit(target("web-1")).unwrap();
    let subscription = h.hub.subscribe(&submission.topic);
    let events = collect(&subscription).await;

    assert_eq!(
        stages(&events),
        vec![Stage::Analyzing, Stage::ManifestReady, Stage::Failed]
    );
    let error = events.last().unwrap().error.clone().unwrap();
    assert_eq!(error.kind, JobErrorKind::Policy);
    assert_eq!(error.stage, Stage::ManifestReady);
    assert!(error.message.contains("host network"));

    assert!(h.fakes.registry.pushed().is_empty());
    assert!(h.fakes.kubernetes.applied().is_empty());

    let status = h.orchestrator.status(&submission.deploy_id).await.unwrap().unwrap();
    assert!(status.steps.iter().all(|s| s.status == StepStatus::Pending));
}

#[tokio::test]
async fn test_scenario_d_failed_step_stops_the_rollout() {
    let h = harness(OrchestratorOptions::default());
    h.fakes.kubernetes.faults.set(
        "apply_manifest",
        Fault::fail(ServiceError::Rejected("admission webhook denied".to_string())),
    );

    let submission = h.orchestrator.submit(target("web-1")).unwrap();
    let subscription = h.hub.subscribe(&submission.topic);
    let events = collect(&subscription).await;
    assert_eq!(events.last().unwrap().stage, Stage::Failed);

    let status = h.orchestrator.status(&submission.deploy_id).await.unwrap().unwrap();
    assert_eq!(status.stage, Stage::Failed);

    let push = status.step(StepName::PushImage).unwrap();
    assert_eq!(push.status, StepStatus::Succeeded);

    let create = status.step(StepName::CreateDeployment).unwrap();
    assert_eq!(create.status, StepStatus::Failed);
    let step_error = create.error.clone().unwrap();
    assert_eq!(step_error.kind, JobErrorKind::Collaborator);
    assert_eq!(step_error.code.as_deref(), Some("rejected"));
    assert_eq!(step_error.step, Some(StepName::CreateDeployment));

    let service = status.step(StepName::CreateService).unwrap();
    assert_eq!(service.status, StepStatus::Pending);
    assert!(service.started_at.is_none());
    assert_eq!(h.fakes.kubernetes.faults.count("apply_manifest"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_e_capacity_ceiling() {
    let h = harness(OrchestratorOptions {
        call_timeout: Duration::from_secs(1),
        admission: AdmissionOptions { max_active: 5 },
        ..Default::default()
    });
    // Hold every job in analyzing until its call times out
    h.fakes
        .docker
        .faults
        .set("get_container", Fault::delay(Duration::from_secs(60)));

    let submissions: Vec<_> = (1..=5)
        .map(|i| h.orchestrator.submit(target(&format!("web-{i}"))).unwrap())
        .collect();
    assert_eq!(h.orchestrator.active_count(), 5);

    let err = h.orchestrator.submit(target("web-6")).unwrap_err();
    assert_eq!(err, AdmissionError::CapacityExceeded { limit: 5 });
    assert_eq!(h.orchestrator.active_count(), 5);

    let subscription = h.hub.subscribe(&submissions[0].topic);
    let events = collect(&subscription).await;
    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Failed);
    assert_eq!(last.error.as_ref().unwrap().kind, JobErrorKind::Timeout);

    wait_for_release(&h.orchestrator, 4).await;
    h.fakes.docker.faults.clear("get_container");
    assert!(h.orchestrator.submit(target("web-6")).is_ok());
}

#[tokio::test]
async fn test_stages_non_decreasing_with_one_terminal() {
    let h = harness(OrchestratorOptions::default());

    let submission = h.orchestrator.submit(target("web-1")).unwrap();
    let subscription = h.hub.subscribe(&submission.topic);
    let events = collect(&subscription).await;

    assert!(events
        .windows(2)
        .all(|w| w[0].stage.ordinal() <= w[1].stage.ordinal()));
    assert!(events.windows(2).all(|w| w[0].revision < w[1].revision));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(events.last().unwrap().stage, Stage::Succeeded);
    assert_eq!(events.last().unwrap().progress, 100);

    // Each step starts only after its predecessor succeeded
    let running: Vec<StepName> = events
        .iter()
        .filter(|e| e.step_status == Some(StepStatus::Running))
        .filter_map(|e| e.step)
        .collect();
    assert_eq!(running, StepName::ORDER.to_vec());
}

#[tokio::test]
async fn test_status_is_idempotent() {
    let h = harness(OrchestratorOptions::default());
    let submission = h.orchestrator.submit(target("web-1")).unwrap();

    let first = h.orchestrator.status(&submission.deploy_id).await.unwrap();
    let second = h.orchestrator.status(&submission.deploy_id).await.unwrap();
    assert_eq!(first, second);

    let subscription = h.hub.subscribe(&submission.topic);
    collect(&subscription).await;
    wait_for_release(&h.orchestrator, 0).await;

    let first = h.orchestrator.status(&submission.deploy_id).await.unwrap();
    let second = h.orchestrator.status(&submission.deploy_id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.unwrap().stage, Stage::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_observed_at_next_boundary() {
    let h = harness(OrchestratorOptions::default());
    h.fakes
        .docker
        .faults
        .set("get_container", Fault::delay(Duration::from_secs(2)));

    let submission = h.orchestrator.submit(target("web-1")).unwrap();
    let subscription = h.hub.subscribe(&submission.topic);
    assert!(h.orchestrator.cancel(&submission.deploy_id));

    let events = collect(&subscription).await;
    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Cancelled);
    assert_eq!(last.error.as_ref().unwrap().kind, JobErrorKind::Cancelled);
    assert!(h.fakes.ai.requests().is_empty());

    wait_for_release(&h.orchestrator, 0).await;
    assert!(!h.orchestrator.cancel(&submission.deploy_id));
}

#[tokio::test(start_paused = true)]
async fn test_job_deadline_carries_the_stage() {
    let h = harness(OrchestratorOptions {
        job_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_secs(30),
        ..Default::default()
    });
    h.fakes
        .ai
        .faults
        .set("generate_manifest", Fault::delay(Duration::from_secs(60)));

    let submission = h.orchestrator.submit(target("web-1")).unwrap();
    let subscription = h.hub.subscribe(&submission.topic);
    let events = collect(&subscription).await;

    let error = events.last().unwrap().error.clone().unwrap();
    assert_eq!(error.kind, JobErrorKind::Timeout);
    assert_eq!(error.stage, Stage::ManifestReady);
}

#[tokio::test]
async fn test_watch_finished_job_and_history() {
    let h = harness(OrchestratorOptions::default());
    let submission = h.orchestrator.submit(target("web-1")).unwrap();

    match h.orchestrator.watch(&submission.deploy_id).await.unwrap() {
        Some(Watch::Live { snapshot, .. }) => assert_eq!(snapshot.stage, Stage::Submitted),
        _ => panic!("expected a live watch"),
    }

    let subscription = h.hub.subscribe(&submission.topic);
    collect(&subscription).await;
    wait_for_release(&h.orchestrator, 0).await;

    match h.orchestrator.watch(&submission.deploy_id).await.unwrap() {
        Some(Watch::Finished(snapshot)) => assert_eq!(snapshot.stage, Stage::Succeeded),
        _ => panic!("expected a finished watch"),
    }

    let history = h.orchestrator.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, submission.deploy_id);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_active_jobs() {
    let h = harness(OrchestratorOptions::default());
    h.fakes
        .docker
        .faults
        .set("get_container", Fault::delay(Duration::from_secs(3)));

    let a = h.orchestrator.submit(target("web-1")).unwrap();
    let b = h.orchestrator.submit(target("web-2")).unwrap();

    h.orchestrator.shutdown(Duration::from_secs(10)).await;
    assert_eq!(h.orchestrator.active_count(), 0);

    for submission in [a, b] {
        let status = h.orchestrator.status(&submission.deploy_id).await.unwrap().unwrap();
        assert_eq!(status.stage, Stage::Cancelled);
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_subscriber_sees_later_events_through_terminal() {
    let h = harness(OrchestratorOptions::default());
    h.fakes
        .ai
        .faults
        .set("generate_manifest", Fault::delay(Duration::from_secs(2)));

    let submission = h.orchestrator.submit(target("web-1")).unwrap();
    let early = h.hub.subscribe(&submission.topic);

    // Join once the job is waiting on the generator
    let mut seen = Vec::new();
    while let Delivery::Message(event) = early.recv().await {
        if let Event::DeployStatus(status) = event.as_ref() {
            seen.push(status.clone());
            if status.stage == Stage::ManifestReady {
                break;
            }
        }
    }
    let joined_after = seen.last().map(|e| e.revision).unwrap();
    let late = h.hub.subscribe(&submission.topic);

    let late_events = collect(&late).await;
    let rest = collect(&early).await;

    assert_eq!(late_events.first().map(|e| e.stage), Some(Stage::Deploying));
    assert!(late_events.iter().all(|e| e.revision > joined_after));
    assert_eq!(late_events.last().map(|e| e.stage), Some(Stage::Succeeded));
    assert_eq!(late_events, rest);
    assert_eq!(late.dropped(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_finished_job_frees_slot_before_record() {
    let h = harness(OrchestratorOptions {
        admission: AdmissionOptions { max_active: 1 },
        ..Default::default()
    });
    h.fakes.store.faults.set(
        "record_deployment",
        Fault::fail(ServiceError::Connectivity("store down".to_string())),
    );

    let first = h.orchestrator.submit(target("web-1")).unwrap();
    let subscription = h.hub.subscribe(&first.topic);
    let events = collect(&subscription).await;
    assert_eq!(events.last().map(|e| e.stage), Some(Stage::Succeeded));
    assert!(h.fakes.store.records().is_empty());

    assert_eq!(h.orchestrator.active_count(), 0);
    assert!(h.orchestrator.submit(target("web-2")).is_ok());
}

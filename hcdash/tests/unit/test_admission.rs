//! Admission controller tests

use std::sync::Arc;

use hcdash::deploy::admission::{AdmissionController, AdmissionError, AdmissionOptions};
use hcdash::deploy::fsm::Stage;
use hcdash::deploy::job::DeployTarget;

fn controller(max_active: usize) -> Arc<AdmissionController> {
    Arc::new(AdmissionController::new(AdmissionOptions { max_active }))
}

#[test]
fn test_racing_submissions_for_one_target_admit_exactly_one() {
    let admission = controller(64);
    let target = DeployTarget::new("web", "prod", "default");

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let admission = admission.clone();
            let target = target.clone();
            std::thread::spawn(move || admission.admit(target))
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let admitted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(admitted.len(), 1);

    let winner = admitted[0].job_id().clone();
    for result in &results {
        if let Err(err) = result {
            assert_eq!(
                err,
                &AdmissionError::DuplicateTarget {
                    existing: winner.clone(),
                    target: target.clone(),
                }
            );
        }
    }
    assert_eq!(admission.active_count(), 1);
}

#[test]
fn test_racing_submissions_never_exceed_capacity() {
    let admission = controller(3);

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let admission = admission.clone();
            std::thread::spawn(move || {
                admission.admit(DeployTarget::new(format!("app-{i}"), "prod", "default"))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 3);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.code() == "capacity_exceeded"));
    assert_eq!(admission.active_count(), 3);

    drop(results);
    assert_eq!(admission.active_count(), 0);
}

#[test]
fn test_ticket_released_when_job_panics() {
    let admission = controller(1);
    let target = DeployTarget::new("web", "prod", "default");

    let ticket = admission.admit(target.clone()).unwrap();
    let outcome = std::thread::spawn(move || {
        let _ticket = ticket;
        panic!("job blew up");
    })
    .join();
    assert!(outcome.is_err());

    assert_eq!(admission.active_count(), 0);
    assert!(admission.admit(target).is_ok());
}

#[test]
fn test_active_jobs_oldest_first_with_latest_snapshots() {
    let admission = controller(5);
    let first = admission.admit(DeployTarget::new("a", "prod", "default")).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let second = admission.admit(DeployTarget::new("b", "prod", "default")).unwrap();

    let mut snapshot = admission.status(second.job_id()).unwrap();
    snapshot.stage = Stage::Analyzing;
    snapshot.revision = 1;
    second.update(snapshot);

    let active = admission.active_jobs();
    assert_eq!(active.len(), 2);
    assert_eq!(&active[0].deploy_id, first.job_id());
    assert_eq!(active[1].stage, Stage::Analyzing);
    assert_eq!(active[1].revision, 1);
}

#[test]
fn test_cancel_all_flags_every_ticket() {
    let admission = controller(5);
    let tickets: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|c| admission.admit(DeployTarget::new(*c, "prod", "default")).unwrap())
        .collect();

    assert_eq!(admission.cancel_all(), 3);
    assert!(tickets.iter().all(|t| t.is_cancelled()));
}

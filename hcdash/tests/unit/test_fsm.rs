//! Stage machine tests

use hcdash::deploy::fsm::{Stage, StageEvent, StageMachine};

const ALL_EVENTS: [StageEvent; 6] = [
    StageEvent::Analyze,
    StageEvent::GenerateManifest,
    StageEvent::Deploy,
    StageEvent::Complete,
    StageEvent::Fail,
    StageEvent::Cancel,
];

fn machine_at(stage: Stage) -> StageMachine {
    let mut fsm = StageMachine::new();
    let path: &[StageEvent] = match stage {
        Stage::Submitted => &[],
        Stage::Analyzing => &[StageEvent::Analyze],
        Stage::ManifestReady => &[StageEvent::Analyze, StageEvent::GenerateManifest],
        Stage::Deploying => &[
            StageEvent::Analyze,
            StageEvent::GenerateManifest,
            StageEvent::Deploy,
        ],
        Stage::Succeeded => &[
            StageEvent::Analyze,
            StageEvent::GenerateManifest,
            StageEvent::Deploy,
            StageEvent::Complete,
        ],
        Stage::Failed => &[StageEvent::Fail],
        Stage::Cancelled => &[StageEvent::Cancel],
    };
    for event in path {
        fsm.process(*event).unwrap();
    }
    assert_eq!(fsm.stage(), stage);
    fsm
}

#[test]
fn test_fsm_initial_state() {
    let fsm = StageMachine::new();
    assert_eq!(fsm.stage(), Stage::Submitted);
    assert!(!fsm.stage().is_terminal());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = StageMachine::new();

    // Submitted -> Analyzing -> ManifestReady -> Deploying -> Succeeded
    assert_eq!(fsm.process(StageEvent::Analyze).unwrap(), Stage::Analyzing);
    assert_eq!(
        fsm.process(StageEvent::GenerateManifest).unwrap(),
        Stage::ManifestReady
    );
    assert_eq!(fsm.process(StageEvent::Deploy).unwrap(), Stage::Deploying);
    assert_eq!(fsm.process(StageEvent::Complete).unwrap(), Stage::Succeeded);
}

#[test]
fn test_fsm_fail_and_cancel_from_every_live_stage() {
    for stage in [
        Stage::Submitted,
        Stage::Analyzing,
        Stage::ManifestReady,
        Stage::Deploying,
    ] {
        let mut fsm = machine_at(stage);
        assert_eq!(fsm.process(StageEvent::Fail).unwrap(), Stage::Failed);

        let mut fsm = machine_at(stage);
        assert_eq!(fsm.process(StageEvent::Cancel).unwrap(), Stage::Cancelled);
    }
}

#[test]
fn test_fsm_terminal_stages_reject_everything() {
    for stage in [Stage::Succeeded, Stage::Failed, Stage::Cancelled] {
        for event in ALL_EVENTS {
            let mut fsm = machine_at(stage);
            let err = fsm.process(event).unwrap_err();
            assert_eq!(err.from, stage);
            assert_eq!(err.event, event);
            assert_eq!(fsm.stage(), stage);
        }
    }
}

#[test]
fn test_fsm_stages_never_go_backwards() {
    for stage in [
        Stage::Submitted,
        Stage::Analyzing,
        Stage::ManifestReady,
        Stage::Deploying,
    ] {
        for event in ALL_EVENTS {
            let mut fsm = machine_at(stage);
            if let Ok(next) = fsm.process(event) {
                assert!(next.ordinal() > stage.ordinal(), "{stage} -> {next}");
            }
        }
    }
}

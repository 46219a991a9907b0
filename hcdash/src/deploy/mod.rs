//! Deployment jobs: admission, stage machine, validation and orchestration

pub mod admission;
pub mod fsm;
pub mod job;
pub mod orchestrator;
pub mod policy;

//! hcdash library
//!
//! Control plane for turning running Docker containers into Kubernetes
//! deployments, with live metrics, logs and deployment progress.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod hub;
pub mod logs;
pub mod server;
pub mod services;
pub mod storage;
pub mod telemetry;
pub mod utils;
pub mod workers;

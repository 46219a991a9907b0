//! HTTP API models for the hcdash control plane

pub mod models;

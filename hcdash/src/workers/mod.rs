//! Background workers

pub mod janitor;
pub mod log_tail;
pub mod sampler;

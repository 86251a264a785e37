//! Callgate - client-side admission control for outbound calls
//!
//! This crate caps how many calls a process issues to a single downstream
//! service per time window. Callers that exceed the cap are suspended until
//! capacity is released, then run their call through the gate.

pub mod config;
pub mod error;
pub mod gate;

pub use error::{CallgateError, GateError, Result};
pub use gate::{AdmissionGate, RateLimitConfig, ReleasePolicy, TimeUnit};

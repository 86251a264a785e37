//! Admission control for outbound calls.

mod action;
mod admission;
mod counter;
mod ticker;

pub use action::Action;
pub use admission::{AdmissionGate, GateStats, Permit, RateLimitConfig, ReleasePolicy};
pub use counter::{TimeUnit, WindowCounter};
pub use ticker::{ManualScheduler, RepeatingTask, ScheduledTask, Scheduler, TokioScheduler};

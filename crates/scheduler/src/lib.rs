//! Select the upstream account a request is forwarded through.
//!
//! Selection cascade (precedence):
//! 1. Previous-response affinity (the account that produced the quoted
//!    response id)
//! 2. Session affinity (sticky binding for the session fingerprint)
//! 3. Load-aware ranking (least loaded, then oldest last-used, top-K with
//!    deterministic tie-break)
//!
//! The scheduler never mutates account state; it reads registry snapshots
//! and is told how each dispatch ended through [`Scheduler::report_outcome`].

pub mod error;
pub mod outcome;
pub mod select;

pub use {
    error::ScheduleError,
    select::{ScheduleLayer, ScheduleRequest, Scheduler, SchedulerConfig, Selection, WaitPlan},
};

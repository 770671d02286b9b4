//! Periodic reconciliation of replica placement: `spec.md` §4.5.

pub mod executor;
pub mod planner;

pub use executor::run_once;
pub use planner::{compute_plan, RebalancePlan};

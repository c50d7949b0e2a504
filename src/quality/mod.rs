//! Quality gating of finished work: checks, review, and the enforcer.

pub mod check;
pub mod gate;
pub mod review;

pub use check::{CheckContext, CheckResult, CommandCheck, CommandOutput, QualityCheck, ShellCommand};
pub use gate::{GateOutcome, GatePolicy, GateRequirements, QualityGate};
pub use review::{CommandReviewer, GateReviewer, ReviewOutcome, Reviewer};

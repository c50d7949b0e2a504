//! Integration test suite for phaser.
//!
//! These tests drive whole phase runs through the `PhaseRunner` with
//! scripted executors, checks, and reviewers, and then inspect what the
//! store recorded.
//!
//! # Test Categories
//!
//! - `run_e2e`: Full runs over small graphs
//! - `claim_contention`: At most one owner per task
//! - `quality_gate`: Retry in place until the gate passes
//! - `resume`: Idempotent resume of partial and finished runs
//! - `recovery`: Worker crashes, exhausted attempts, store outages
//!
//! # CI Compatibility
//!
//! No external commands are spawned; everything runs in-process.

mod fixtures;

mod claim_contention;
mod quality_gate;
mod recovery;
mod resume;

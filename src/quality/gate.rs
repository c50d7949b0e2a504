//! Quality Gate Enforcer.
//!
//! Sits between "the worker says it is done" and `complete`. Required checks
//! run in order and stop at the first failure. Optional checks run only once
//! every required check passed, and their failures become warnings. A review
//! follows when the policy asks for one. Every result is written to the
//! store, tagged with the 1-based attempt it belongs to.

use super::check::{CheckContext, QualityCheck};
use super::review::{GateReviewer, Reviewer};
use crate::error::{Error, Result};
use crate::store::{
    Checkpoint, CodeReview, GateStatus, GateType, QualityGateResult, ReviewVerdict, RunStore,
    TaskRunId,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default elapsed time before a task writes a checkpoint.
pub const DEFAULT_CHECKPOINT_THRESHOLD_SECS: u64 = 1800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    /// Gate evaluations allowed per task run. `None` retries indefinitely.
    pub retry_cap: Option<u32>,
    pub checkpoint_threshold: Duration,
    pub require_review: bool,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            retry_cap: None,
            checkpoint_threshold: Duration::from_secs(DEFAULT_CHECKPOINT_THRESHOLD_SECS),
            require_review: true,
        }
    }
}

impl GatePolicy {
    /// Whether another evaluation may follow a failed `attempt`.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.retry_cap.map_or(true, |cap| attempt < cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Passed { warnings: Vec<String> },
    Blocked { failures: Vec<String> },
}

impl GateOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, GateOutcome::Passed { .. })
    }
}

/// What `complete` must find in the store before it accepts a task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRequirements {
    pub required: Vec<GateType>,
    pub require_review: bool,
}

impl GateRequirements {
    /// Check the latest stored result of every required gate type, and the
    /// latest review verdict when one is required.
    ///
    /// # Errors
    ///
    /// `QualityGateFailure` naming the first unsatisfied requirement.
    pub async fn verify(&self, store: &dyn RunStore, task_run_id: TaskRunId) -> Result<()> {
        let results = store.gate_results(task_run_id).await?;
        for gate_type in &self.required {
            let latest = results.iter().rev().find(|r| r.gate_type == *gate_type);
            match latest.map(|r| r.status) {
                Some(GateStatus::Passed) => {}
                Some(GateStatus::Failed) => {
                    return Err(Error::QualityGateFailure {
                        task_run_id,
                        summary: format!("{} check failed", gate_type),
                    })
                }
                None => {
                    return Err(Error::QualityGateFailure {
                        task_run_id,
                        summary: format!("{} check has not run", gate_type),
                    })
                }
            }
        }

        if self.require_review {
            let reviews = store.code_reviews(task_run_id).await?;
            match reviews.last().map(|r| r.verdict) {
                Some(ReviewVerdict::Approved) => {}
                Some(ReviewVerdict::NeedsFollowup) => {
                    return Err(Error::QualityGateFailure {
                        task_run_id,
                        summary: "review requested follow-up".to_string(),
                    })
                }
                None => {
                    return Err(Error::QualityGateFailure {
                        task_run_id,
                        summary: "no approved review".to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}

pub struct QualityGate {
    store: Arc<dyn RunStore>,
    required: Vec<Arc<dyn QualityCheck>>,
    optional: Vec<Arc<dyn QualityCheck>>,
    reviewer: Arc<dyn Reviewer>,
    policy: GatePolicy,
}

impl QualityGate {
    /// Split `checks` into required and optional, keeping their order.
    ///
    /// Without a reviewer, a `GateReviewer` is used.
    pub fn new(
        store: Arc<dyn RunStore>,
        checks: Vec<Arc<dyn QualityCheck>>,
        reviewer: Option<Arc<dyn Reviewer>>,
        policy: GatePolicy,
    ) -> Self {
        let (required, optional) = checks.into_iter().partition(|c| c.required());
        Self {
            store,
            required,
            optional,
            reviewer: reviewer.unwrap_or_else(|| Arc::new(GateReviewer::new())),
            policy,
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    pub fn requirements(&self) -> GateRequirements {
        let mut required: Vec<GateType> = self.required.iter().map(|c| c.gate_type()).collect();
        required.dedup();
        GateRequirements {
            required,
            require_review: self.policy.require_review,
        }
    }

    /// Run one gate evaluation for `ctx.attempt`.
    ///
    /// # Errors
    ///
    /// Only store failures. A failing check is a `Blocked` outcome.
    pub async fn evaluate(&self, ctx: &CheckContext) -> Result<GateOutcome> {
        for check in &self.required {
            let result = check.run(ctx).await;
            self.record(ctx, check.as_ref(), &result.errors, result.passed, result.summary())
                .await?;
            if !result.passed {
                info!(
                    task = %ctx.task_id,
                    attempt = ctx.attempt,
                    gate = %check.gate_type(),
                    "quality gate blocked"
                );
                let failures = prefixed(check.gate_type(), &result.errors, &result.summary());
                return Ok(GateOutcome::Blocked { failures });
            }
        }

        let mut warnings = Vec::new();
        for check in &self.optional {
            let result = check.run(ctx).await;
            self.record(ctx, check.as_ref(), &result.errors, result.passed, result.summary())
                .await?;
            if !result.passed {
                warn!(task = %ctx.task_id, gate = %check.gate_type(), "optional check failed");
                warnings.extend(prefixed(check.gate_type(), &result.errors, &result.summary()));
            }
        }

        if self.policy.require_review {
            let outcome = self.reviewer.review(ctx, &warnings).await;
            self.store
                .on_code_review(CodeReview {
                    phase_run_id: ctx.phase_run_id,
                    task_run_id: ctx.task_run_id,
                    reviewer: self.reviewer.name().to_string(),
                    verdict: outcome.verdict,
                    summary: outcome.summary.clone(),
                    attempt: ctx.attempt,
                    recorded_at: Utc::now(),
                })
                .await?;
            let status = if outcome.is_approved() {
                GateStatus::Passed
            } else {
                GateStatus::Failed
            };
            self.store
                .on_quality_gate(QualityGateResult {
                    phase_run_id: ctx.phase_run_id,
                    task_run_id: ctx.task_run_id,
                    gate_type: GateType::Review,
                    status,
                    summary: outcome.summary.clone(),
                    checked_by: self.reviewer.name().to_string(),
                    attempt: ctx.attempt,
                    errors: Vec::new(),
                    recorded_at: Utc::now(),
                })
                .await?;
            if !outcome.is_approved() {
                info!(task = %ctx.task_id, attempt = ctx.attempt, "review requested follow-up");
                return Ok(GateOutcome::Blocked {
                    failures: vec![format!("review: {}", outcome.summary)],
                });
            }
        }

        info!(task = %ctx.task_id, attempt = ctx.attempt, "quality gate passed");
        Ok(GateOutcome::Passed { warnings })
    }

    /// Write an advisory checkpoint. Never completes anything.
    pub async fn checkpoint(&self, ctx: &CheckContext, elapsed: Duration, note: &str) -> Result<()> {
        self.store
            .on_checkpoint(Checkpoint {
                phase_run_id: ctx.phase_run_id,
                task_run_id: ctx.task_run_id,
                attempt: ctx.attempt,
                elapsed_secs: elapsed.as_secs(),
                note: note.to_string(),
                recorded_at: Utc::now(),
            })
            .await
    }

    async fn record(
        &self,
        ctx: &CheckContext,
        check: &dyn QualityCheck,
        errors: &[String],
        passed: bool,
        summary: String,
    ) -> Result<()> {
        self.store
            .on_quality_gate(QualityGateResult {
                phase_run_id: ctx.phase_run_id,
                task_run_id: ctx.task_run_id,
                gate_type: check.gate_type(),
                status: if passed {
                    GateStatus::Passed
                } else {
                    GateStatus::Failed
                },
                summary,
                checked_by: check.name().to_string(),
                attempt: ctx.attempt,
                errors: errors.to_vec(),
                recorded_at: Utc::now(),
            })
            .await
    }
}

fn prefixed(gate_type: GateType, errors: &[String], summary: &str) -> Vec<String> {
    if errors.is_empty() {
        return vec![format!("{}: {}", gate_type, summary)];
    }
    errors.iter().map(|e| format!("{}: {}", gate_type, e)).collect()
}

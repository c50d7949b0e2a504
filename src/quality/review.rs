//! Code review boundary.

use super::check::{CheckContext, ShellCommand};
use crate::store::ReviewVerdict;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub verdict: ReviewVerdict,
    pub summary: String,
}

impl ReviewOutcome {
    pub fn approved(summary: impl Into<String>) -> Self {
        Self {
            verdict: ReviewVerdict::Approved,
            summary: summary.into(),
        }
    }

    pub fn needs_followup(summary: impl Into<String>) -> Self {
        Self {
            verdict: ReviewVerdict::NeedsFollowup,
            summary: summary.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.verdict == ReviewVerdict::Approved
    }
}

/// Reviews a task run once its required checks have passed.
#[async_trait]
pub trait Reviewer: Send + Sync {
    fn name(&self) -> &str;

    /// `warnings` are the failures of optional checks from the same evaluation.
    async fn review(&self, ctx: &CheckContext, warnings: &[String]) -> ReviewOutcome;
}

/// Approves whatever reached review, noting optional-check warnings.
#[derive(Debug, Clone)]
pub struct GateReviewer {
    name: String,
}

impl GateReviewer {
    pub fn new() -> Self {
        Self {
            name: "gate".to_string(),
        }
    }
}

impl Default for GateReviewer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reviewer for GateReviewer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn review(&self, _ctx: &CheckContext, warnings: &[String]) -> ReviewOutcome {
        if warnings.is_empty() {
            ReviewOutcome::approved("required checks passed")
        } else {
            ReviewOutcome::approved(format!(
                "required checks passed; warnings: {}",
                warnings.join("; ")
            ))
        }
    }
}

/// Runs an external review command. Exit status 0 approves.
///
/// The command sees the same environment as checks plus
/// `PHASER_WARNINGS` (newline separated).
pub struct CommandReviewer {
    name: String,
    command: ShellCommand,
}

impl CommandReviewer {
    pub fn new(name: &str, command: ShellCommand) -> Self {
        Self {
            name: name.to_string(),
            command,
        }
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn review(&self, ctx: &CheckContext, warnings: &[String]) -> ReviewOutcome {
        let env = [
            ("PHASER_TASK_ID", ctx.task_id.to_string()),
            ("PHASER_TASK_SUBJECT", ctx.subject.clone()),
            ("PHASER_TASK_RUN_ID", ctx.task_run_id.to_string()),
            ("PHASER_ATTEMPT", ctx.attempt.to_string()),
            ("PHASER_WARNINGS", warnings.join("\n")),
        ];
        match self.command.run(&env).await {
            Ok(output) => {
                let summary = output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .map(str::to_string);
                if output.success {
                    ReviewOutcome::approved(summary.unwrap_or_else(|| "approved".to_string()))
                } else {
                    let items = output.error_items();
                    ReviewOutcome::needs_followup(
                        summary.unwrap_or_else(|| items.join("; ")),
                    )
                }
            }
            Err(err) => ReviewOutcome::needs_followup(format!("review could not run: {}", err)),
        }
    }
}

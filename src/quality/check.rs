//! Quality check boundary.
//!
//! A check is an opaque external command that reports `{passed, errors}`.
//! The gate only sees the `QualityCheck` trait, so tests and embedders can
//! plug in their own checks.

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::store::{GateType, PhaseRunId, TaskRunId};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Upper bound on error items kept from one check run.
pub const MAX_ERROR_ITEMS: usize = 20;

/// What a check is being run against.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub phase_run_id: PhaseRunId,
    pub task_run_id: TaskRunId,
    pub task_id: TaskId,
    pub subject: String,
    /// 1-based gate evaluation for this task run.
    pub attempt: u32,
}

impl CheckContext {
    fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("PHASER_TASK_ID", self.task_id.to_string()),
            ("PHASER_TASK_SUBJECT", self.subject.clone()),
            ("PHASER_TASK_RUN_ID", self.task_run_id.to_string()),
            ("PHASER_ATTEMPT", self.attempt.to_string()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub passed: bool,
    pub errors: Vec<String>,
}

impl CheckResult {
    pub fn passed() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            passed: false,
            errors,
        }
    }

    /// One-line summary for the gate record.
    pub fn summary(&self) -> String {
        match (self.passed, self.errors.first()) {
            (true, _) => "passed".to_string(),
            (false, None) => "failed".to_string(),
            (false, Some(first)) if self.errors.len() == 1 => first.clone(),
            (false, Some(first)) => format!("{} (+{} more)", first, self.errors.len() - 1),
        }
    }
}

#[async_trait]
pub trait QualityCheck: Send + Sync {
    fn gate_type(&self) -> GateType;

    /// Recorded as `checked_by`.
    fn name(&self) -> &str;

    /// Required checks block completion; optional ones only warn.
    fn required(&self) -> bool;

    /// Run the check. Infrastructure problems (missing binary, timeout) are
    /// reported as a failed result rather than an error.
    async fn run(&self, ctx: &CheckContext) -> CheckResult;
}

/// Output of a finished shell command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Non-empty lines of stderr, falling back to stdout, capped at `MAX_ERROR_ITEMS`.
    pub fn error_items(&self) -> Vec<String> {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let mut items: Vec<String> = source
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(MAX_ERROR_ITEMS)
            .map(str::to_string)
            .collect();
        if items.is_empty() && !self.success {
            items.push(format!(
                "exited with code {}",
                self.exit_code.map_or("unknown".to_string(), |c| c.to_string())
            ));
        }
        items
    }
}

/// A command line run through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    shell: PathBuf,
    command: String,
    timeout: Option<Duration>,
}

impl ShellCommand {
    /// # Errors
    ///
    /// Returns `Validation` if the command is empty or `sh` is not on `PATH`.
    pub fn new(command: &str) -> Result<Self> {
        if command.trim().is_empty() {
            return Err(Error::Validation("command must not be empty".to_string()));
        }
        let shell = which::which("sh")
            .map_err(|_| Error::Validation("no `sh` found on PATH".to_string()))?;
        Ok(Self {
            shell,
            command: command.to_string(),
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run to completion with extra environment variables.
    ///
    /// # Errors
    ///
    /// `Io` if the process cannot be spawned, `Timeout` if it overruns.
    pub async fn run(&self, env: &[(&str, String)]) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        debug!(command = %self.command, "running shell command");
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => cmd.output().await?,
        };

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A check backed by a shell command: exit status 0 passes.
pub struct CommandCheck {
    gate_type: GateType,
    name: String,
    required: bool,
    command: ShellCommand,
}

impl CommandCheck {
    pub fn new(gate_type: GateType, command: ShellCommand, required: bool) -> Self {
        Self {
            gate_type,
            name: gate_type.to_string(),
            required,
            command,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

#[async_trait]
impl QualityCheck for CommandCheck {
    fn gate_type(&self) -> GateType {
        self.gate_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn run(&self, ctx: &CheckContext) -> CheckResult {
        match self.command.run(&ctx.env()).await {
            Ok(output) if output.success => CheckResult::passed(),
            Ok(output) => CheckResult::failed(output.error_items()),
            Err(err) => CheckResult::failed(vec![format!("{} could not run: {}", self.name, err)]),
        }
    }
}

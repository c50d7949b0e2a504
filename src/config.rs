use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::orchestration::{CommandExecutor, HealthConfig, RunSettings, TaskExecutor};
use crate::quality::{CommandCheck, CommandReviewer, GatePolicy, QualityCheck, Reviewer, ShellCommand};
use crate::store::GateType;
use crate::{Error, Result};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub executor: ExecutorConfig,
    pub gate: GateConfig,
    pub review: ReviewConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_workers: usize,
    pub assigned_agent: String,
    pub worker_timeout_secs: u64,
    pub heartbeat_interval_ms: u64,
    /// Worker failures per task before the task is marked failed.
    pub max_task_attempts: Option<u32>,
    pub store_dir: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            assigned_agent: "phaser".to_string(),
            worker_timeout_secs: crate::orchestration::DEFAULT_WORKER_TIMEOUT_SECS,
            heartbeat_interval_ms: crate::orchestration::DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_task_attempts: Some(3),
            store_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExecutorConfig {
    pub command: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub retry_cap: Option<u32>,
    pub checkpoint_threshold_secs: u64,
    pub require_review: bool,
    pub checks: Vec<CheckConfig>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            retry_cap: None,
            checkpoint_threshold_secs: crate::quality::gate::DEFAULT_CHECKPOINT_THRESHOLD_SECS,
            require_review: true,
            checks: vec![
                CheckConfig::new(GateType::Lint, "cargo clippy --all-targets -- -D warnings", true),
                CheckConfig::new(GateType::Build, "cargo build", true),
                CheckConfig::new(GateType::Test, "cargo test", false),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub gate_type: GateType,
    pub command: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_required() -> bool {
    true
}

impl CheckConfig {
    pub fn new(gate_type: GateType, command: &str, required: bool) -> Self {
        Self {
            gate_type,
            command: command.to_string(),
            required,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub command: Option<String>,
    pub reviewer: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            command: None,
            reviewer: "reviewer".to_string(),
        }
    }
}

impl Config {
    pub fn phaser_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".phaser"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::phaser_dir()?.join("phaser.toml"))
    }

    /// Load from the default location; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::config_path()?, false),
        };
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            if explicit {
                return Err(Error::Validation(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        debug!(
            max_workers = config.run.max_workers,
            checks = config.gate.checks.len(),
            executor = ?config.executor.command,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.max_workers == 0 {
            return Err(Error::Validation("run.max_workers must be at least 1".into()));
        }
        if self.run.worker_timeout_secs == 0 {
            return Err(Error::Validation("run.worker_timeout_secs must be positive".into()));
        }
        if self.run.heartbeat_interval_ms == 0 {
            return Err(Error::Validation("run.heartbeat_interval_ms must be positive".into()));
        }
        if self.run.heartbeat_interval_ms >= self.run.worker_timeout_secs.saturating_mul(1000) {
            return Err(Error::Validation(format!(
                "run.heartbeat_interval_ms ({}) must be shorter than run.worker_timeout_secs ({}s)",
                self.run.heartbeat_interval_ms, self.run.worker_timeout_secs
            )));
        }
        if self.run.max_task_attempts == Some(0) {
            return Err(Error::Validation("run.max_task_attempts must be at least 1".into()));
        }
        if self.gate.retry_cap == Some(0) {
            return Err(Error::Validation("gate.retry_cap must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for check in &self.gate.checks {
            if check.gate_type == GateType::Review {
                return Err(Error::Validation(
                    "review is configured under [review], not as a check".into(),
                ));
            }
            if !seen.insert(check.gate_type) {
                return Err(Error::Validation(format!(
                    "duplicate {} check",
                    check.gate_type
                )));
            }
            if check.command.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "{} check has an empty command",
                    check.gate_type
                )));
            }
        }
        for gate_type in [GateType::Lint, GateType::Build] {
            let required = self
                .gate
                .checks
                .iter()
                .any(|c| c.gate_type == gate_type && c.required);
            if !required {
                return Err(Error::Validation(format!(
                    "the gate needs a required {} check",
                    gate_type
                )));
            }
        }
        Ok(())
    }

    /// Directory holding the run journal.
    pub fn store_dir(&self) -> Result<PathBuf> {
        match &self.run.store_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::phaser_dir()?.join("runs")),
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        let heartbeat = Duration::from_millis(self.run.heartbeat_interval_ms);
        RunSettings {
            max_workers: self.run.max_workers,
            assigned_agent: self.run.assigned_agent.clone(),
            max_task_attempts: self.run.max_task_attempts,
            heartbeat_interval: heartbeat,
            health: HealthConfig {
                worker_timeout: Duration::from_secs(self.run.worker_timeout_secs),
                check_interval: heartbeat,
            },
            gate: GatePolicy {
                retry_cap: self.gate.retry_cap,
                checkpoint_threshold: Duration::from_secs(self.gate.checkpoint_threshold_secs),
                require_review: self.gate.require_review,
            },
        }
    }

    pub fn checks(&self) -> Result<Vec<Arc<dyn QualityCheck>>> {
        self.gate
            .checks
            .iter()
            .map(|c| {
                let command = ShellCommand::new(&c.command)?
                    .with_timeout(c.timeout_secs.map(Duration::from_secs));
                Ok(Arc::new(CommandCheck::new(c.gate_type, command, c.required))
                    as Arc<dyn QualityCheck>)
            })
            .collect()
    }

    /// The configured reviewer command, if any.
    pub fn reviewer(&self) -> Result<Option<Arc<dyn Reviewer>>> {
        match &self.review.command {
            Some(command) => {
                let command = ShellCommand::new(command)?;
                Ok(Some(Arc::new(CommandReviewer::new(&self.review.reviewer, command))))
            }
            None => Ok(None),
        }
    }

    pub fn executor(&self) -> Result<Arc<dyn TaskExecutor>> {
        let command = self.executor.command.as_deref().ok_or_else(|| {
            Error::Validation("no executor command configured ([executor] command)".into())
        })?;
        let command = ShellCommand::new(command)?
            .with_timeout(self.executor.timeout_secs.map(Duration::from_secs));
        Ok(Arc::new(CommandExecutor::new(command)))
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

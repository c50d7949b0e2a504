//! Loading task lists authored by the planning collaborator.
//!
//! A task list is TOML (`[[tasks]]` tables) or JSON (an object with a
//! `tasks` array, or a bare array), chosen by file extension.

use crate::core::task::TaskSpec;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskList {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl TaskList {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let list = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_toml(&content)?
        };
        debug!(path = %path.display(), tasks = list.tasks.len(), "task list loaded");
        Ok(list)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        if value.is_array() {
            return Ok(Self::new(serde_json::from_value(value)?));
        }
        if value.get("tasks").is_none() {
            return Err(Error::Validation(
                "JSON task list must be an array or an object with a `tasks` array".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

//! Run report - what ran, how it ended, what was published

use crate::core::ExecutionResult;
use crate::error::Error;
use crate::publish::Artifact;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One nodeforge invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub id: String,
    pub workflow: String,
    pub entry: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskRecord>,
    pub artifacts: Vec<Artifact>,
    pub error: Option<String>,
}

/// Summary of one task; captured output is not kept
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: String,
    pub command: Option<String>,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Done,
    Failed,
    /// Dry run: rendered, not executed
    Planned,
    /// No command, only groups dependencies
    Grouping,
    /// Destructive task the operator refused
    Declined,
}

impl RunReport {
    pub fn new(workflow: impl Into<String>, entry: impl Into<String>, dry_run: bool) -> Self {
        let started_at = Utc::now();
        Self {
            id: started_at.format("%Y-%m-%d-%H-%M-%S").to_string(),
            workflow: workflow.into(),
            entry: entry.into(),
            dry_run,
            started_at,
            ended_at: None,
            tasks: Vec::new(),
            artifacts: Vec::new(),
            error: None,
        }
    }

    /// Record a finished command
    pub fn record(&mut self, command: &str, result: &ExecutionResult) {
        self.tasks.push(TaskRecord {
            task: result.task.clone(),
            command: Some(command.to_string()),
            status: if result.success() {
                TaskStatus::Done
            } else {
                TaskStatus::Failed
            },
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis(),
        });
    }

    /// Record a task that did not execute a command
    pub fn note(&mut self, task: &str, command: Option<String>, status: TaskStatus) {
        self.tasks.push(TaskRecord {
            task: task.to_string(),
            command,
            status,
            exit_code: None,
            duration_ms: 0,
        });
    }

    pub fn add_artifact(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    /// Close the report, noting the failure if there was one
    pub fn finish(&mut self, error: Option<&Error>) {
        self.ended_at = Some(Utc::now());
        self.error = error.map(ToString::to_string);
    }

    pub fn succeeded(&self) -> bool {
        self.ended_at.is_some() && self.error.is_none()
    }

    /// Save as pretty JSON
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

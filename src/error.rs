//! Error taxonomy and exit-code mapping

use std::time::Duration;
use thiserror::Error;

/// Generic failure when no subprocess exit code is available
pub const EXIT_FAILURE: u8 = 1;
/// Operator declined a destructive task
pub const EXIT_DECLINED: u8 = 3;
/// A task exceeded its timeout (same code as coreutils `timeout`)
pub const EXIT_TIMEOUT: u8 = 124;
/// Run interrupted by the operator
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Error, Debug)]
pub enum Error {
    #[error("task '{0}' is already defined")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected between tasks: {}", .tasks.join(" -> "))]
    CycleDetected { tasks: Vec<String> },

    #[error("task '{0}' not found")]
    UnknownTask(String),

    #[error("entry point '{0}' is not defined by the workflow")]
    UnknownEntryPoint(String),

    #[error("could not resolve parameter '{name}': {reason}")]
    ParameterResolution { name: String, reason: String },

    #[error("parameter '{name}' fell back to '{value}' and its policy forbids proceeding")]
    FallbackRejected { name: String, value: String },

    #[error("task '{task}' requires parameter '{name}', which was never resolved")]
    MissingParameter { task: String, name: String },

    #[error("task '{task}' failed ({})", describe_exit(.code))]
    TaskFailed {
        task: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("task '{task}' timed out after {timeout:?}")]
    TaskTimeout { task: String, timeout: Duration },

    #[error("task '{task}' was cancelled")]
    Cancelled { task: String },

    #[error("confirmation declined for destructive task '{task}'")]
    Declined { task: String },

    #[error("failed to start task '{task}': {source}")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to publish '{artifact}' to '{key}': {reason}")]
    Publish {
        artifact: String,
        key: String,
        reason: String,
    },

    #[error("could not extract artifact: {0}")]
    Extraction(String),

    #[error("invalid workflow: {0}")]
    Workflow(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl Error {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::TaskFailed {
                code: Some(code), ..
            } if (1..=255).contains(code) => *code as u8,
            Error::Declined { .. } => EXIT_DECLINED,
            Error::TaskTimeout { .. } => EXIT_TIMEOUT,
            Error::Cancelled { .. } => EXIT_CANCELLED,
            _ => EXIT_FAILURE,
        }
    }

    /// Name of the task the failure belongs to, if any
    pub fn task(&self) -> Option<&str> {
        match self {
            Error::DuplicateTask(task) | Error::UnknownTask(task) => Some(task.as_str()),
            Error::UnknownDependency { task, .. }
            | Error::MissingParameter { task, .. }
            | Error::TaskFailed { task, .. }
            | Error::TaskTimeout { task, .. }
            | Error::Cancelled { task }
            | Error::Declined { task }
            | Error::Spawn { task, .. } => Some(task.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

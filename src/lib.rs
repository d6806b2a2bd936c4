//! nodeforge - graph-driven build orchestration for hardened EKS node images
//!
//! Workflows declare tasks (external Terraform, Packer, Docker and AWS CLI
//! commands), the parameters they need, and the artifacts they publish. A run
//! resolves parameters once, executes the entry point's dependency chain in
//! order and stops at the first failure.

pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod publish;
pub mod report;
pub mod workflow;

// Re-exports
pub use app::{App, AppOptions};
pub use config::Config;
pub use core::{Executor, Task, TaskEvent, TaskGraph, TaskRunner};
pub use error::{Error, Result};
pub use report::{RunReport, TaskStatus};
pub use workflow::Workflow;

//! Core engine - task graph, parameters, subprocess execution, task running

mod confirm;
mod executor;
mod graph;
mod params;
mod runner;
mod template;

pub use confirm::{is_affirmative, AssumeYes, Confirm, PromptConfirm};
pub use executor::{ExecutionResult, Executor, Invocation, ProcessOptions, Stream, TaskEvent};
pub use graph::{Task, TaskGraph};
pub use params::{
    Lookup, OnFallback, Parameter, ParameterResolver, Resolution, ResolutionStatus, ShellLookup,
    Source,
};
pub use runner::{RunOptions, TaskRunner};
pub use template::CommandTemplate;

//! Application - wires config, workflow, resolver and runner for one run

use crate::config::Config;
use crate::core::{Confirm, Executor, Lookup, ParameterResolver, RunOptions, TaskRunner};
use crate::error::{Error, Result};
use crate::publish::{ArtifactPublisher, Registry};
use crate::report::RunReport;
use crate::workflow::Workflow;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-run switches
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    pub run: RunOptions,
    /// Treat every fallback as fatal, whatever the parameter says
    pub strict: bool,
}

/// Application state for one run
pub struct App {
    pub workflow: Workflow,
    pub config: Config,
    pub options: AppOptions,
    executor: Executor,
    lookup: Arc<dyn Lookup>,
    registry: Option<Box<dyn Registry>>,
    confirm: Option<Box<dyn Confirm>>,
}

impl App {
    pub fn new(
        workflow: Workflow,
        config: Config,
        options: AppOptions,
        executor: Executor,
        lookup: Arc<dyn Lookup>,
        registry: Box<dyn Registry>,
        confirm: Box<dyn Confirm>,
    ) -> Self {
        Self {
            workflow,
            config,
            options,
            executor,
            lookup,
            registry: Some(registry),
            confirm: Some(confirm),
        }
    }

    /// Run an entry point. The report is filled in whether or not it succeeds.
    pub async fn run(&mut self, entry: &str, report: &mut RunReport) -> Result<()> {
        let result = self.execute(entry, report).await;
        report.finish(result.as_ref().err());
        result
    }

    async fn execute(&mut self, entry: &str, report: &mut RunReport) -> Result<()> {
        let order = self.workflow.plan(entry)?;
        log::info!("Entry point {}: {}", entry, order.join(" -> "));

        // workflow definitions override config values of the same name
        let mut resolver = ParameterResolver::new(
            self.config
                .parameters()
                .into_iter()
                .chain(self.workflow.parameters.iter().cloned()),
            self.config.env.clone(),
            self.lookup.clone(),
        )
        .strict(self.options.strict);

        let required = self.required_params(&order, &resolver)?;
        let values: HashMap<String, String> = resolver.resolve_all(&required).await?;

        let (Some(registry), Some(confirm)) = (self.registry.take(), self.confirm.take()) else {
            return Err(Error::Workflow("application already ran".to_string()));
        };
        let mut runner = TaskRunner::new(
            &self.workflow.graph,
            self.executor.clone(),
            ArtifactPublisher::new(registry),
            confirm,
            self.options.run.clone(),
        );
        runner.run(&order, &values, report).await
    }

    /// Every parameter the ordered tasks need; an undefined one fails before
    /// anything runs
    fn required_params(
        &self,
        order: &[String],
        resolver: &ParameterResolver,
    ) -> Result<Vec<String>> {
        let mut required: Vec<String> = Vec::new();
        for name in order {
            let task = self
                .workflow
                .graph
                .get_task(name)
                .ok_or_else(|| Error::UnknownTask(name.clone()))?;
            for param in task.required_params() {
                if !resolver.is_defined(&param) {
                    return Err(Error::MissingParameter {
                        task: task.name.clone(),
                        name: param,
                    });
                }
                if !required.contains(&param) {
                    required.push(param);
                }
            }
        }
        Ok(required)
    }
}

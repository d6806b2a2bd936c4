//! Workflow files - parameters, tasks and entry points in YAML
//!
//! ```yaml
//! metadata:
//!   project: eks-cis
//! parameters:
//!   account_id:
//!     lookup: aws sts get-caller-identity --query Account --output text
//!     fallback: ERROR_GETTING_ACCOUNT
//!     on_fallback: abort
//! tasks:
//!   init:
//!     command: terraform -chdir=terraform/image init -input=false
//!   plan:
//!     depends_on: [init]
//!     command: terraform -chdir=terraform/image plan -var region={region}
//! entrypoints:
//!   plan:
//!     task: plan
//!     description: Plan the image build infrastructure
//! ```

use crate::core::{OnFallback, Parameter, Source, Task, TaskGraph};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Workflow used when no file is given and `nodeforge.yml` is absent
pub const BUNDLED_WORKFLOW: &str = include_str!("../workflows/eks-cis.yml");

/// File looked up in the working directory
pub const DEFAULT_WORKFLOW_FILE: &str = "nodeforge.yml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub project: String,
    pub version: Option<String>,
    pub description: Option<String>,
}

/// A named way into the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Target task; it runs after all of its transitive dependencies
    pub task: String,
    #[serde(default)]
    pub description: String,
}

/// Parameter as written in YAML: exactly one of `value`, `env`, `lookup`,
/// `computed`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParameterDef {
    value: Option<String>,
    env: Option<String>,
    default: Option<String>,
    lookup: Option<String>,
    computed: Option<String>,
    fallback: Option<String>,
    #[serde(default)]
    on_fallback: OnFallback,
}

impl ParameterDef {
    fn into_parameter(self, name: &str) -> Result<Parameter> {
        let invalid = |reason: &str| Error::Workflow(format!("parameter '{}': {}", name, reason));

        let source = match (self.value, self.env, self.lookup, self.computed) {
            (Some(value), None, None, None) => Source::Literal(value),
            (None, Some(var), None, None) => Source::Env {
                var,
                default: self.default.clone(),
            },
            (None, None, Some(command), None) => Source::Lookup { command },
            (None, None, None, Some(template)) => Source::Computed { template },
            (None, None, None, None) => {
                return Err(invalid("needs one of value, env, lookup or computed"))
            }
            _ => return Err(invalid("value, env, lookup and computed are mutually exclusive")),
        };
        if self.default.is_some() && !matches!(source, Source::Env { .. }) {
            return Err(invalid("default only applies to env parameters"));
        }

        Ok(Parameter {
            name: name.to_string(),
            source,
            fallback: self.fallback,
            on_fallback: self.on_fallback,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    metadata: Option<Metadata>,
    #[serde(default)]
    parameters: BTreeMap<String, ParameterDef>,
    /// Kept as a mapping so declaration order survives
    #[serde(default)]
    tasks: serde_yaml::Mapping,
    #[serde(default)]
    entrypoints: BTreeMap<String, EntryPoint>,
}

/// A loaded, validated workflow
#[derive(Debug, Clone)]
pub struct Workflow {
    pub metadata: Option<Metadata>,
    pub parameters: Vec<Parameter>,
    pub graph: TaskGraph,
    pub entrypoints: BTreeMap<String, EntryPoint>,
}

impl Workflow {
    /// Parse and validate. Graph errors surface here, before anything runs.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: WorkflowFile = serde_yaml::from_str(content)?;

        let parameters = file
            .parameters
            .into_iter()
            .map(|(name, def)| def.into_parameter(&name))
            .collect::<Result<Vec<_>>>()?;

        let mut graph = TaskGraph::new();
        for (key, value) in file.tasks {
            let name = key
                .as_str()
                .ok_or_else(|| Error::Workflow(format!("task name {:?} is not a string", key)))?
                .to_string();
            let mut task: Task = serde_yaml::from_value(value)
                .map_err(|e| Error::Workflow(format!("task '{}': {}", name, e)))?;
            task.name = name;
            graph.declare(task)?;
        }
        graph.finalize()?;

        for (name, entry) in &file.entrypoints {
            if graph.get_task(&entry.task).is_none() {
                return Err(Error::Workflow(format!(
                    "entry point '{}' targets unknown task '{}'",
                    name, entry.task
                )));
            }
        }

        Ok(Self {
            metadata: file.metadata,
            parameters,
            graph,
            entrypoints: file.entrypoints,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn bundled() -> Result<Self> {
        Self::from_yaml(BUNDLED_WORKFLOW)
    }

    /// Pick the workflow for this run:
    /// 1. an explicit path
    /// 2. `nodeforge.yml` in the current directory
    /// 3. the bundled EKS CIS workflow
    pub fn auto_load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            log::info!("Loading workflow from: {}", path.display());
            return Self::from_file(path);
        }

        let local = Path::new(DEFAULT_WORKFLOW_FILE);
        if local.exists() {
            log::info!("Loading workflow from: {}", local.display());
            return Self::from_file(local);
        }

        log::info!("Using bundled workflow");
        Self::bundled()
    }

    pub fn name(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.project.as_str())
            .unwrap_or("unnamed")
    }

    pub fn entry(&self, name: &str) -> Result<&EntryPoint> {
        self.entrypoints
            .get(name)
            .ok_or_else(|| Error::UnknownEntryPoint(name.to_string()))
    }

    /// Execution order for an entry point
    pub fn plan(&self, entry: &str) -> Result<Vec<String>> {
        self.graph.order_for(&self.entry(entry)?.task)
    }
}

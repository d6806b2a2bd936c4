//! Parameter resolution - literal, environment, external lookup and computed
//! values, cached once per run.
//!
//! A failed lookup never silently becomes a value: it either errors or yields
//! the configured fallback tagged [`ResolutionStatus::Fallback`], and callers
//! decide through [`OnFallback`] whether that is acceptable.

use super::executor::{Executor, Invocation, ProcessOptions};
use super::template::CommandTemplate;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// How a parameter obtains its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Literal(String),
    Env { var: String, default: Option<String> },
    /// Command template whose trimmed stdout is the value
    Lookup { command: String },
    /// Template over other parameters
    Computed { template: String },
}

/// What to do when a parameter had to fall back to its sentinel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnFallback {
    #[default]
    Abort,
    Warn,
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub source: Source,
    pub fallback: Option<String>,
    pub on_fallback: OnFallback,
}

impl Parameter {
    pub fn new(name: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            source,
            fallback: None,
            on_fallback: OnFallback::Abort,
        }
    }

    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, Source::Literal(value.into()))
    }

    pub fn with_fallback(mut self, value: impl Into<String>, policy: OnFallback) -> Self {
        self.fallback = Some(value.into());
        self.on_fallback = policy;
        self
    }

    /// Other parameters referenced by this one's source
    fn references(&self) -> Vec<String> {
        match &self.source {
            Source::Lookup { command } => CommandTemplate::new(command.as_str()).placeholders(),
            Source::Computed { template } => CommandTemplate::new(template.as_str()).placeholders(),
            Source::Literal(_) | Source::Env { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStatus {
    Resolved,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub value: String,
    pub status: ResolutionStatus,
}

impl Resolution {
    pub fn is_fallback(&self) -> bool {
        self.status == ResolutionStatus::Fallback
    }
}

/// External lookup seam
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Run `command` and return its output, or a reason it failed
    async fn lookup(&self, command: &str) -> std::result::Result<String, String>;
}

/// Runs lookups as shell commands through the executor
pub struct ShellLookup {
    executor: Executor,
    timeout: Option<Duration>,
}

impl ShellLookup {
    pub fn new(executor: Executor, timeout: Option<Duration>) -> Self {
        Self { executor, timeout }
    }
}

#[async_trait]
impl Lookup for ShellLookup {
    async fn lookup(&self, command: &str) -> std::result::Result<String, String> {
        let options = ProcessOptions {
            timeout: self.timeout,
            ..Default::default()
        };
        let result = self
            .executor
            .execute("lookup", Invocation::Shell(command.to_string()), &options)
            .await
            .map_err(|e| e.to_string())?;

        if result.success() {
            Ok(result.stdout)
        } else {
            Err(format!(
                "exited with {:?}: {}",
                result.exit_code,
                result.stderr.trim()
            ))
        }
    }
}

/// Run-scoped resolver; each run owns one and drops it with the run
pub struct ParameterResolver {
    params: HashMap<String, Parameter>,
    env: HashMap<String, String>,
    lookup: Arc<dyn Lookup>,
    cache: HashMap<String, Resolution>,
    strict: bool,
}

impl ParameterResolver {
    pub fn new(
        params: impl IntoIterator<Item = Parameter>,
        env: HashMap<String, String>,
        lookup: Arc<dyn Lookup>,
    ) -> Self {
        Self {
            params: params.into_iter().map(|p| (p.name.clone(), p)).collect(),
            env,
            lookup,
            cache: HashMap::new(),
            strict: false,
        }
    }

    /// Reject every fallback regardless of the parameter's own policy
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Resolve one parameter (and anything it references), using the cache
    pub async fn resolve(&mut self, name: &str) -> Result<Resolution> {
        for pending in self.plan(name)? {
            if !self.cache.contains_key(&pending) {
                let resolution = self.resolve_one(&pending).await?;
                self.cache.insert(pending, resolution);
            }
        }
        Ok(self.cache[name].clone())
    }

    /// Resolve a set of parameters and enforce the fallback policy
    pub async fn resolve_all<I, S>(&mut self, names: I) -> Result<HashMap<String, String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = HashMap::new();
        for name in names {
            let name = name.as_ref();
            let resolution = self.resolve(name).await?;
            self.check_fallback(name, &resolution)?;
            if resolution.is_fallback() {
                log::warn!(
                    "Parameter {} using fallback value '{}'",
                    name,
                    resolution.value
                );
            }
            values.insert(name.to_string(), resolution.value);
        }
        Ok(values)
    }

    fn check_fallback(&self, name: &str, resolution: &Resolution) -> Result<()> {
        if !resolution.is_fallback() {
            return Ok(());
        }
        if self.strict || self.params[name].on_fallback == OnFallback::Abort {
            return Err(Error::FallbackRejected {
                name: name.to_string(),
                value: resolution.value.clone(),
            });
        }
        Ok(())
    }

    /// Values resolved so far this run
    pub fn values(&self) -> HashMap<String, String> {
        self.cache
            .iter()
            .map(|(k, r)| (k.clone(), r.value.clone()))
            .collect()
    }

    /// Dependency-first list of parameters needed to resolve `name`
    fn plan(&self, name: &str) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut stack = Vec::new();
        self.visit(name, &mut stack, &mut order)?;
        Ok(order)
    }

    fn visit(&self, name: &str, stack: &mut Vec<String>, order: &mut Vec<String>) -> Result<()> {
        if self.cache.contains_key(name) || order.iter().any(|n| n == name) {
            return Ok(());
        }
        if let Some(start) = stack.iter().position(|n| n == name) {
            let mut chain = stack[start..].to_vec();
            chain.push(name.to_string());
            return Err(Error::ParameterResolution {
                name: name.to_string(),
                reason: format!("circular reference: {}", chain.join(" -> ")),
            });
        }

        let param = self.params.get(name).ok_or_else(|| Error::ParameterResolution {
            name: name.to_string(),
            reason: match stack.last() {
                Some(parent) => format!("referenced by '{}' but not defined", parent),
                None => "not defined".to_string(),
            },
        })?;

        stack.push(name.to_string());
        for reference in param.references() {
            self.visit(&reference, stack, order)?;
        }
        stack.pop();
        order.push(name.to_string());
        Ok(())
    }

    async fn resolve_one(&self, name: &str) -> Result<Resolution> {
        let param = &self.params[name];
        let references = param.references();
        let tainted = references
            .iter()
            .any(|r| self.cache.get(r).is_some_and(Resolution::is_fallback));
        let inputs: HashMap<String, String> = references
            .iter()
            .filter_map(|r| self.cache.get(r).map(|res| (r.clone(), res.value.clone())))
            .collect();

        let attempt = match &param.source {
            Source::Literal(value) => Ok(value.clone()),
            Source::Env { var, default } => match self.env.get(var).filter(|v| !v.is_empty()) {
                Some(value) => Ok(value.clone()),
                None => default
                    .clone()
                    .ok_or_else(|| format!("environment variable {} is not set", var)),
            },
            Source::Lookup { command } => {
                // a rejected fallback must never reach an external command
                for reference in &references {
                    if let Some(input) = self.cache.get(reference) {
                        self.check_fallback(reference, input)?;
                    }
                }
                let command = CommandTemplate::new(command.as_str()).render(name, &inputs)?;
                log::debug!("Looking up {}: {}", name, command);
                match self.lookup.lookup(&command).await {
                    Ok(output) => {
                        let value = output.trim();
                        if value.is_empty() || value == "None" {
                            Err("lookup returned no value".to_string())
                        } else {
                            Ok(value.to_string())
                        }
                    }
                    Err(reason) => Err(reason),
                }
            }
            Source::Computed { template } => {
                Ok(CommandTemplate::new(template.as_str()).render(name, &inputs)?)
            }
        };

        match (attempt, &param.fallback) {
            (Ok(value), _) => {
                log::debug!("Resolved {} = {}", name, value);
                let status = if tainted {
                    ResolutionStatus::Fallback
                } else {
                    ResolutionStatus::Resolved
                };
                Ok(Resolution { value, status })
            }
            (Err(reason), Some(fallback)) => {
                log::warn!("Lookup for {} failed ({}), using fallback", name, reason);
                Ok(Resolution {
                    value: fallback.clone(),
                    status: ResolutionStatus::Fallback,
                })
            }
            (Err(reason), None) => Err(Error::ParameterResolution {
                name: name.to_string(),
                reason,
            }),
        }
    }
}

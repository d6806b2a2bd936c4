//! Artifact publishing - pull identifiers out of tool output and record them
//! in the parameter store for downstream workflows.
//!
//! A Packer build with a manifest post-processor declares:
//!
//! ```yaml
//! publish:
//!   - name: Level1AmiId
//!     key: /{namespace}/ami/level1/id
//!     source: { file: packer/manifest.json }
//!     rule: { path: "builds[-1].artifact_id", after: ":" }
//! ```

use crate::core::{Executor, Invocation, ProcessOptions};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Where the extractable output comes from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    #[default]
    Stdout,
    /// Path template, relative to the task's working directory
    File(String),
}

/// How to find the value inside the output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    /// Dot-separated JSON fields with `[i]` indexing; negative indices count
    /// from the end. Without a path the last non-empty line is taken.
    pub path: Option<String>,
    /// Keep only the text after the first occurrence of this delimiter
    pub after: Option<String>,
}

/// Artifact declared on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    /// Registry key template, `/<namespace>/<component>/<level>/<field>`
    pub key: String,
    #[serde(default)]
    pub source: ArtifactSource,
    #[serde(default)]
    pub rule: ExtractionRule,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

fn default_overwrite() -> bool {
    true
}

impl ArtifactSpec {
    /// Templates that need parameter values before publishing
    pub fn templates(&self) -> Vec<String> {
        let mut templates = vec![self.key.clone()];
        if let ArtifactSource::File(path) = &self.source {
            templates.push(path.clone());
        }
        templates
    }
}

/// A published value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub value: String,
    pub key: String,
    pub overwrite: bool,
    pub published_at: DateTime<Utc>,
}

/// Apply an extraction rule to tool output
pub fn extract(output: &str, rule: &ExtractionRule) -> Result<String> {
    let raw = match &rule.path {
        Some(path) => {
            let document: Value = serde_json::from_str(output)
                .map_err(|e| Error::Extraction(format!("output is not JSON: {}", e)))?;
            let found = lookup_path(&document, path)?;
            match found {
                Value::String(s) => s.clone(),
                Value::Number(_) | Value::Bool(_) => found.to_string(),
                other => {
                    return Err(Error::Extraction(format!(
                        "'{}' is not a scalar: {}",
                        path, other
                    )))
                }
            }
        }
        None => output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| Error::Extraction("output is empty".to_string()))?
            .to_string(),
    };

    let value = match &rule.after {
        Some(delimiter) => raw
            .split_once(delimiter.as_str())
            .map(|(_, rest)| rest.to_string())
            .ok_or_else(|| {
                Error::Extraction(format!("'{}' does not contain '{}'", raw, delimiter))
            })?,
        None => raw,
    };

    if value.is_empty() {
        return Err(Error::Extraction("extracted value is empty".to_string()));
    }
    Ok(value)
}

fn lookup_path<'a>(document: &'a Value, path: &str) -> Result<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        let (field, indices) = parse_segment(segment)?;
        if !field.is_empty() {
            current = current.get(field).ok_or_else(|| {
                Error::Extraction(format!("field '{}' not found in '{}'", field, path))
            })?;
        }
        for index in indices {
            let items = current.as_array().ok_or_else(|| {
                Error::Extraction(format!("'{}' is not a list in '{}'", segment, path))
            })?;
            let position = if index < 0 {
                items.len().checked_sub(index.unsigned_abs() as usize)
            } else {
                Some(index as usize)
            };
            current = position.and_then(|p| items.get(p)).ok_or_else(|| {
                Error::Extraction(format!(
                    "index {} out of range for '{}' ({} items)",
                    index,
                    segment,
                    items.len()
                ))
            })?;
        }
    }
    Ok(current)
}

/// `builds[-1]` -> ("builds", [-1])
fn parse_segment(segment: &str) -> Result<(&str, Vec<i64>)> {
    let invalid = || Error::Extraction(format!("invalid path segment '{}'", segment));
    let (field, mut rest) = match segment.find('[') {
        Some(i) => (&segment[..i], &segment[i..]),
        None => (segment, ""),
    };
    let mut indices = Vec::new();
    while !rest.is_empty() {
        let close = rest.find(']').ok_or_else(invalid)?;
        if !rest.starts_with('[') {
            return Err(invalid());
        }
        indices.push(rest[1..close].trim().parse().map_err(|_| invalid())?);
        rest = &rest[close + 1..];
    }
    if field.is_empty() && indices.is_empty() {
        return Err(invalid());
    }
    Ok((field, indices))
}

/// External key/value registry
#[async_trait]
pub trait Registry: Send + Sync {
    async fn put(&self, key: &str, value: &str, overwrite: bool) -> std::result::Result<(), String>;
}

/// AWS SSM Parameter Store through the AWS CLI
pub struct SsmRegistry {
    executor: Executor,
    region: String,
}

impl SsmRegistry {
    pub fn new(executor: Executor, region: impl Into<String>) -> Self {
        Self {
            executor,
            region: region.into(),
        }
    }

    fn argv(&self, key: &str, value: &str, overwrite: bool) -> Vec<String> {
        let mut argv: Vec<String> = [
            "aws", "ssm", "put-parameter", "--name", key, "--value", value, "--type", "String",
            "--region", self.region.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if overwrite {
            argv.push("--overwrite".to_string());
        }
        argv
    }
}

#[async_trait]
impl Registry for SsmRegistry {
    async fn put(
        &self,
        key: &str,
        value: &str,
        overwrite: bool,
    ) -> std::result::Result<(), String> {
        let result = self
            .executor
            .execute(
                "publish",
                Invocation::Argv(self.argv(key, value, overwrite)),
                &ProcessOptions::default(),
            )
            .await
            .map_err(|e| e.to_string())?;

        if result.success() {
            Ok(())
        } else {
            Err(format!(
                "aws ssm put-parameter exited with {:?}: {}",
                result.exit_code,
                result.stderr.trim()
            ))
        }
    }
}

/// In-process registry for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn put(
        &self,
        key: &str,
        value: &str,
        overwrite: bool,
    ) -> std::result::Result<(), String> {
        let mut entries = self.entries.lock().map_err(|e| e.to_string())?;
        if !overwrite && entries.contains_key(key) {
            return Err(format!("{} already exists and overwrite is disabled", key));
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Writes artifacts to a registry; every failure is surfaced
pub struct ArtifactPublisher {
    registry: Box<dyn Registry>,
}

impl ArtifactPublisher {
    pub fn new(registry: Box<dyn Registry>) -> Self {
        Self { registry }
    }

    pub async fn publish(
        &self,
        artifact: &str,
        value: &str,
        key: &str,
        overwrite: bool,
    ) -> Result<Artifact> {
        self.registry
            .put(key, value, overwrite)
            .await
            .map_err(|reason| Error::Publish {
                artifact: artifact.to_string(),
                key: key.to_string(),
                reason,
            })?;

        log::info!("Published {} = {} to {}", artifact, value, key);
        Ok(Artifact {
            name: artifact.to_string(),
            value: value.to_string(),
            key: key.to_string(),
            overwrite,
            published_at: Utc::now(),
        })
    }
}

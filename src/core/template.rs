//! Command templates - `{param}` placeholders rendered against resolved values
//!
//! Only identifier-shaped placeholders are recognised, so shell and Go template
//! syntax such as `{{index .RepoDigests 0}}` or `${HOME}` passes through
//! untouched:
//!
//! ```text
//! terraform -chdir=terraform/cluster apply -var region={region} -var vpc_id={vpc_id}
//! ```

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex")
    })
}

/// A command string with named placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
}

impl CommandTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholder names in the order they first appear
    pub fn placeholders(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        placeholder_re()
            .captures_iter(&self.source)
            .filter_map(|cap| {
                let name = cap[1].to_string();
                seen.insert(name.clone()).then_some(name)
            })
            .collect()
    }

    /// Substitute every placeholder. `owner` names the task (or parameter)
    /// reported in a `MissingParameter` error.
    pub fn render(&self, owner: &str, values: &HashMap<String, String>) -> Result<String> {
        let mut missing = None;
        let rendered = placeholder_re().replace_all(&self.source, |cap: &regex::Captures| {
            match values.get(&cap[1]) {
                Some(value) => value.clone(),
                None => {
                    missing.get_or_insert_with(|| cap[1].to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(name) => Err(Error::MissingParameter {
                task: owner.to_string(),
                name,
            }),
            None => Ok(rendered.into_owned()),
        }
    }
}

impl From<&str> for CommandTemplate {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for CommandTemplate {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_placeholders_deduplicated_in_order() {
        let template =
            CommandTemplate::new("aws ec2 run --region {region} --vpc {vpc_id} --r {region}");
        assert_eq!(template.placeholders(), vec!["region", "vpc_id"]);
    }

    #[test]
    fn test_foreign_brace_syntax_is_ignored() {
        let template = CommandTemplate::new(
            "docker inspect --format '{{index .RepoDigests 0}}' ${HOME} {image}",
        );
        assert_eq!(template.placeholders(), vec!["image"]);

        let rendered = template
            .render("digest", &values(&[("image", "repo:tag")]))
            .unwrap();
        assert_eq!(
            rendered,
            "docker inspect --format '{{index .RepoDigests 0}}' ${HOME} repo:tag"
        );
    }

    #[test]
    fn test_render_missing_parameter() {
        let template = CommandTemplate::new("terraform destroy -var subnet={subnet_id}");
        let err = template.render("clean", &HashMap::new()).unwrap_err();
        match err {
            Error::MissingParameter { task, name } => {
                assert_eq!(task, "clean");
                assert_eq!(name, "subnet_id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

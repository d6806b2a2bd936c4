//! Environment-provided configuration, read once at startup

use crate::core::Parameter;
use std::collections::HashMap;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_PREFIX: &str = "eks-cis";
pub const DEFAULT_IMAGE_TAG: &str = "latest";
pub const DEFAULT_NAMESPACE: &str = "nodeforge";

/// Immutable for the whole run
#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,
    /// Resource-name prefix
    pub prefix: String,
    pub image_tag: String,
    /// First segment of registry keys
    pub namespace: String,
    /// Snapshot of the environment for `env:` parameters
    pub env: HashMap<String, String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let env: HashMap<String, String> = vars.into_iter().collect();
        let pick = |keys: &[&str], default: &str| {
            keys.iter()
                .filter_map(|k| env.get(*k))
                .find(|v| !v.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            region: pick(&["AWS_REGION", "AWS_DEFAULT_REGION"], DEFAULT_REGION),
            prefix: pick(&["NODEFORGE_PREFIX"], DEFAULT_PREFIX),
            image_tag: pick(&["IMAGE_TAG"], DEFAULT_IMAGE_TAG),
            namespace: pick(&["NODEFORGE_NAMESPACE"], DEFAULT_NAMESPACE),
            env,
        }
    }

    /// Literal parameters every workflow can reference
    pub fn parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::literal("region", &self.region),
            Parameter::literal("prefix", &self.prefix),
            Parameter::literal("image_tag", &self.image_tag),
            Parameter::literal("namespace", &self.namespace),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(Vec::new());
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.prefix, DEFAULT_PREFIX);
        assert_eq!(config.image_tag, DEFAULT_IMAGE_TAG);
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_region_precedence() {
        let config = Config::from_vars(vars(&[
            ("AWS_DEFAULT_REGION", "eu-central-1"),
            ("AWS_REGION", "eu-west-1"),
        ]));
        assert_eq!(config.region, "eu-west-1");

        let config = Config::from_vars(vars(&[
            ("AWS_REGION", ""),
            ("AWS_DEFAULT_REGION", "eu-central-1"),
        ]));
        assert_eq!(config.region, "eu-central-1");
    }

    #[test]
    fn test_parameters_expose_config() {
        let config =
            Config::from_vars(vars(&[("NODEFORGE_PREFIX", "prod"), ("IMAGE_TAG", "v1.2.0")]));
        let names: Vec<_> = config.parameters().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["region", "prefix", "image_tag", "namespace"]);
        assert_eq!(config.prefix, "prod");
        assert_eq!(config.image_tag, "v1.2.0");
        assert_eq!(config.env.get("IMAGE_TAG").map(String::as_str), Some("v1.2.0"));
    }
}

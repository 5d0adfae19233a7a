//! Compose file parser

use super::config::{ComposeConfig, NetworksConfig};
use super::env::Environment;
use super::interpolate::interpolate_value;
use crate::error::{Result, StevedoreError};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// A parsed descriptor together with the non-fatal findings made while parsing it
#[derive(Debug, Clone)]
pub struct ParsedCompose {
    pub config: ComposeConfig,
    pub warnings: Vec<String>,
}

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Read a compose file into an uninterpolated YAML tree
    pub fn load_value(path: &Path) -> Result<Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StevedoreError::ComposeParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::value_from_str(&content)
            .map_err(|e| StevedoreError::ComposeParse(format!("{}: {}", path.display(), e)))
    }

    fn value_from_str(content: &str) -> Result<Value> {
        let value: Value = serde_yaml::from_str(content)
            .map_err(|e| StevedoreError::ComposeParse(format!("Failed to parse YAML: {}", e)))?;

        match value {
            Value::Mapping(_) => Ok(value),
            Value::Null => Ok(Value::Mapping(Default::default())),
            _ => Err(StevedoreError::ComposeParse(
                "Top-level element must be a mapping".to_string(),
            )),
        }
    }

    /// Parse compose content, substituting placeholders from `env`
    pub fn parse_str(content: &str, env: &Environment) -> Result<ParsedCompose> {
        let value = Self::value_from_str(content)?;
        Self::parse_value(value, env)
    }

    /// Parse one or more compose files, later files overriding earlier ones
    pub fn parse_files(paths: &[PathBuf], env: &Environment) -> Result<ParsedCompose> {
        let merged = Self::load_files(paths)?;
        Self::parse_value(merged, env)
    }

    /// Load and merge compose files without substituting placeholders
    pub fn load_files(paths: &[PathBuf]) -> Result<Value> {
        if paths.is_empty() {
            return Err(StevedoreError::ComposeParse(
                "No compose file given".to_string(),
            ));
        }

        let mut merged = Value::Mapping(Default::default());
        for path in paths {
            tracing::debug!("Loading compose file {}", path.display());
            let value = Self::load_value(path)?;
            merged = Self::merge_values(merged, value);
        }

        Ok(merged)
    }

    /// Interpolate and deserialize a YAML tree
    pub fn parse_value(mut value: Value, env: &Environment) -> Result<ParsedCompose> {
        interpolate_value(&mut value, env)?;

        let mut unknown: Vec<String> = Vec::new();
        let config: ComposeConfig = serde_ignored::deserialize(value, |path| {
            unknown.push(path.to_string());
        })
        .map_err(|e| StevedoreError::ComposeParse(format!("Invalid compose file: {}", e)))?;

        let warnings = unknown
            .into_iter()
            .map(|path| format!("Unsupported key '{}' is ignored", path))
            .collect();

        Ok(ParsedCompose { config, warnings })
    }

    /// Merge two compose trees
    ///
    /// Mappings are merged key by key; any other value in `overlay`
    /// replaces the one in `base`. `environment` and `labels` lists
    /// (`KEY=VALUE`) are turned into mappings first so either form merges
    /// per key.
    pub fn merge_values(base: Value, overlay: Value) -> Value {
        match (base, overlay) {
            (Value::Mapping(mut base), Value::Mapping(overlay)) => {
                for (key, value) in overlay {
                    let merged = match base.remove(&key) {
                        Some(existing) => match key.as_str() {
                            Some(field @ ("environment" | "labels")) => Self::merge_values(
                                key_value_mapping(existing, field),
                                key_value_mapping(value, field),
                            ),
                            _ => Self::merge_values(existing, value),
                        },
                        None => value,
                    };
                    base.insert(key, merged);
                }
                Value::Mapping(base)
            }
            (base, Value::Null) => base,
            (_, overlay) => overlay,
        }
    }

    /// Validate compose configuration
    ///
    /// Returns warnings for constructs that are accepted but have reduced
    /// meaning; structural problems are errors.
    pub fn validate(config: &ComposeConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.services.is_empty() {
            return Err(StevedoreError::Configuration(
                "No services defined".to_string(),
            ));
        }

        for (name, service) in &config.services {
            // Service must have either image or build
            if service.image.is_none() && service.build.is_none() {
                return Err(StevedoreError::Configuration(format!(
                    "Service '{}' must have either 'image' or 'build' specified",
                    name
                )));
            }

            // Validate depends_on references
            if let Some(depends) = &service.depends_on {
                for (dep, condition) in depends.entries() {
                    if dep == *name {
                        return Err(StevedoreError::Configuration(format!(
                            "Service '{}' depends on itself",
                            name
                        )));
                    }
                    if !config.services.contains_key(&dep) {
                        return Err(StevedoreError::Configuration(format!(
                            "Service '{}' depends on unknown service '{}'",
                            name, dep
                        )));
                    }
                    if condition != super::config::CONDITION_STARTED {
                        warnings.push(format!(
                            "Service '{}' waits for '{}' with condition '{}'; only start order is enforced",
                            name, dep, condition
                        ));
                    }
                }
            }

            // Validate network references
            if let Some(networks) = &service.networks {
                let nets: Vec<&String> = match networks {
                    NetworksConfig::Array(arr) => arr.iter().collect(),
                    NetworksConfig::Map(map) => map.keys().collect(),
                };

                for net in nets {
                    if net != "default" && !config.networks.contains_key(net) {
                        return Err(StevedoreError::Configuration(format!(
                            "Service '{}' refers to undefined network '{}'",
                            name, net
                        )));
                    }
                }
            }
        }

        Ok(warnings)
    }
}

/// `KEY=VALUE` list as a mapping; other values pass through
///
/// A bare `KEY` becomes null in `environment` (inherit from the shell) and
/// an empty string in `labels`.
fn key_value_mapping(value: Value, field: &str) -> Value {
    let Value::Sequence(items) = value else {
        return value;
    };
    // anything but a list of strings is left for deserialization to reject
    if !items.iter().all(Value::is_string) {
        return Value::Sequence(items);
    }

    let mut map = Mapping::new();
    for entry in items.iter().filter_map(Value::as_str) {
        let (key, value) = match entry.split_once('=') {
            Some((key, value)) => (key, Value::from(value)),
            None if field == "environment" => (entry, Value::Null),
            None => (entry, Value::from("")),
        };
        map.insert(Value::from(key), value);
    }
    Value::Mapping(map)
}

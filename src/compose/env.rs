//! Environment variable sets
//!
//! An [`Environment`] is the name -> value mapping placeholders are resolved
//! against. It is assembled once per invocation from `.env` files and the
//! process environment, the process environment taking precedence.

use crate::error::{Result, StevedoreError};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;

/// Default env file name looked up in the project directory
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Environment variable set used for placeholder substitution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment
    ///
    /// Variables whose name or value is not valid UTF-8 are skipped.
    pub fn from_process() -> Self {
        Self::from_os_vars(std::env::vars_os())
    }

    fn from_os_vars(vars: impl IntoIterator<Item = (OsString, OsString)>) -> Self {
        let mut env = Self::new();
        for (key, value) in vars {
            match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => {
                    env.vars.insert(key, value);
                }
                (Ok(key), Err(_)) => {
                    tracing::debug!("Skipping {}: value is not valid UTF-8", key);
                }
                (Err(key), _) => {
                    tracing::debug!("Skipping {:?}: name is not valid UTF-8", key);
                }
            }
        }
        env
    }

    /// Load a `.env` style file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StevedoreError::Configuration(format!(
                "Failed to read env file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::parse(&content).map_err(|e| match e {
            StevedoreError::Configuration(msg) => {
                StevedoreError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse `.env` content
    ///
    /// Accepts `KEY=value`, `export KEY=value`, blank lines and `#` comments.
    /// Single-quoted values are taken literally; double-quoted values
    /// understand `\n`, `\t`, `\"` and `\\`. Unquoted values lose trailing
    /// ` #` comments and surrounding whitespace.
    pub fn parse(content: &str) -> Result<Self> {
        let mut vars = BTreeMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

            let (key, value) = line.split_once('=').ok_or_else(|| {
                StevedoreError::Configuration(format!(
                    "line {}: expected KEY=VALUE, got '{}'",
                    idx + 1,
                    line
                ))
            })?;

            let key = key.trim();
            if !is_valid_name(key) {
                return Err(StevedoreError::Configuration(format!(
                    "line {}: invalid variable name '{}'",
                    idx + 1,
                    key
                )));
            }

            let value = parse_value(value.trim()).map_err(|msg| {
                StevedoreError::Configuration(format!("line {}: {}", idx + 1, msg))
            })?;

            vars.insert(key.to_string(), value);
        }

        Ok(Self { vars })
    }

    /// Set a variable
    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    /// Builder-style [`Environment::set`]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    /// Remove a variable
    pub fn unset(&mut self, key: &str) {
        self.vars.remove(key);
    }

    /// Look up a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }

    /// Whether a variable is defined (possibly empty)
    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Overlay `other` on top of this set; values in `other` win
    pub fn merge(mut self, other: Environment) -> Self {
        self.vars.extend(other.vars);
        self
    }

    /// Iterate over variables in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Variable names: letters, digits and underscores, not starting with a digit
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_value(value: &str) -> std::result::Result<String, String> {
    if let Some(rest) = value.strip_prefix('\'') {
        let end = rest
            .find('\'')
            .ok_or_else(|| "unterminated single-quoted value".to_string())?;
        return Ok(rest[..end].to_string());
    }

    if let Some(rest) = value.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.chars();
        while let Some(c) = chars.next() {
            match c {
                '"' => return Ok(out),
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                    None => break,
                },
                _ => out.push(c),
            }
        }
        return Err("unterminated double-quoted value".to_string());
    }

    let unquoted = match value.find(" #") {
        Some(pos) => &value[..pos],
        None => value,
    };
    Ok(unquoted.trim().to_string())
}

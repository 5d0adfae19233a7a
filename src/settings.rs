//! Invocation settings
//!
//! Everything the CLI gathers from flags and the environment before a
//! project is loaded: where the descriptor lives, which env files feed
//! placeholder substitution, and which engine materialises the project.

use crate::compose::env::{Environment, DEFAULT_ENV_FILE};
use crate::compose::parser::ComposeParser;
use crate::error::{Result, StevedoreError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which engine backs the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineKind {
    /// The `docker` CLI
    #[default]
    Docker,
    /// State-only engine under the data directory
    Local,
}

impl FromStr for EngineKind {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(EngineKind::Docker),
            "local" => Ok(EngineKind::Local),
            other => Err(StevedoreError::Configuration(format!(
                "Unknown engine '{}' (expected 'docker' or 'local')",
                other
            ))),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Docker => write!(f, "docker"),
            EngineKind::Local => write!(f, "local"),
        }
    }
}

/// Where to find a project and how to build its environment
#[derive(Debug, Clone)]
pub struct ProjectSettings {
    /// Directory relative paths in the descriptor resolve against
    pub project_dir: PathBuf,
    /// Explicit descriptor files; discovered in `project_dir` when empty
    pub compose_files: Vec<PathBuf>,
    /// Explicit env files; `<project_dir>/.env` is used when empty and present
    pub env_files: Vec<PathBuf>,
    /// Project name override
    pub project_name: Option<String>,
    /// Whether the process environment overlays the env files
    pub use_process_env: bool,
}

impl ProjectSettings {
    /// Settings for a project directory with everything else discovered
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            compose_files: Vec::new(),
            env_files: Vec::new(),
            project_name: None,
            use_process_env: true,
        }
    }

    /// Descriptor files to load, in merge order
    pub fn compose_files(&self) -> Result<Vec<PathBuf>> {
        if !self.compose_files.is_empty() {
            return Ok(self
                .compose_files
                .iter()
                .map(|p| self.absolute(p))
                .collect());
        }

        ComposeParser::find_compose_file(&self.project_dir)
            .map(|p| vec![p])
            .ok_or_else(|| {
                StevedoreError::Configuration(format!(
                    "No compose file found in {}",
                    self.project_dir.display()
                ))
            })
    }

    /// The environment placeholders resolve against
    pub fn environment(&self) -> Result<Environment> {
        let mut env = Environment::new();

        if self.env_files.is_empty() {
            let default = self.project_dir.join(DEFAULT_ENV_FILE);
            if default.is_file() {
                tracing::debug!("Loading env file {}", default.display());
                env = env.merge(Environment::from_file(&default)?);
            }
        } else {
            for path in &self.env_files {
                let path = self.absolute(path);
                tracing::debug!("Loading env file {}", path.display());
                env = env.merge(Environment::from_file(&path)?);
            }
        }

        if self.use_process_env {
            env = env.merge(Environment::from_process());
        }

        Ok(env)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

/// Engine selection and its state location
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub kind: EngineKind,
    /// Root of the local engine's state
    pub data_dir: PathBuf,
}

impl EngineSettings {
    pub fn new(kind: EngineKind, data_dir: Option<PathBuf>) -> Self {
        Self {
            kind,
            data_dir: data_dir.unwrap_or_else(Self::default_data_dir),
        }
    }

    /// `<platform data dir>/stevedore`
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("stevedore")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_from_str() {
        assert_eq!("docker".parse::<EngineKind>().unwrap(), EngineKind::Docker);
        assert_eq!("LOCAL".parse::<EngineKind>().unwrap(), EngineKind::Local);
        assert!("podman".parse::<EngineKind>().unwrap_err().is_configuration());
    }

    #[test]
    fn test_default_env_file_is_loaded() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join(".env"), "DB_NAME=quickdish\n").unwrap();

        let mut settings = ProjectSettings::new(temp.path());
        settings.use_process_env = false;

        let env = settings.environment().unwrap();
        assert_eq!(env.get("DB_NAME"), Some("quickdish"));
    }

    #[test]
    fn test_explicit_env_files_replace_default() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join(".env"), "DB_NAME=default\n").unwrap();
        std::fs::write(temp.path().join("prod.env"), "DB_USER=prod\n").unwrap();

        let mut settings = ProjectSettings::new(temp.path());
        settings.use_process_env = false;
        settings.env_files = vec![PathBuf::from("prod.env")];

        let env = settings.environment().unwrap();
        assert_eq!(env.get("DB_USER"), Some("prod"));
        assert!(!env.contains("DB_NAME"));
    }

    #[test]
    fn test_compose_file_discovery() {
        let temp = tempfile::tempdir().unwrap();
        let settings = ProjectSettings::new(temp.path());
        assert!(settings.compose_files().unwrap_err().is_configuration());

        std::fs::write(temp.path().join("compose.yaml"), "services: {}\n").unwrap();
        let files = settings.compose_files().unwrap();
        assert_eq!(files, vec![temp.path().join("compose.yaml")]);
    }
}

//! Container lifecycle management

use super::config::{ContainerConfig, ContainerStatus};
use super::runtime::Container;
use crate::error::{Result, StevedoreError};
use crate::storage::index;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

const INDEX_FILE: &str = "containers.json";

/// Container manager for handling container lifecycle
pub struct ContainerManager {
    /// All containers indexed by ID
    containers: Arc<RwLock<BTreeMap<String, Container>>>,
    /// Directory holding the index file
    base_path: PathBuf,
}

impl ContainerManager {
    /// Open the container index under `base_path`
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        let containers = index::load(&base_path.join(INDEX_FILE))?;

        Ok(Self {
            containers: Arc::new(RwLock::new(containers)),
            base_path,
        })
    }

    /// Create a new container; names are unique
    pub fn create(&self, config: ContainerConfig) -> Result<Container> {
        let mut containers = self.containers.write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        if containers.values().any(|c| c.config.name == config.name) {
            return Err(StevedoreError::Engine(format!(
                "Container name {} is already in use",
                config.name
            )));
        }

        let container = Container::new(config);
        containers.insert(container.id.clone(), container.clone());
        self.persist(&containers)?;

        Ok(container)
    }

    /// Start a container
    pub fn start(&self, id: &str) -> Result<()> {
        self.update(id, Container::start)
    }

    /// Stop a container
    pub fn stop(&self, id: &str) -> Result<()> {
        self.update(id, |c| {
            c.stop();
            Ok(())
        })
    }

    /// Remove a container; a running one only with `force`
    pub fn remove(&self, id: &str, force: bool) -> Result<Container> {
        let mut containers = self.containers.write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        let container = containers.get(id)
            .ok_or_else(|| StevedoreError::ContainerNotFound(id.to_string()))?;

        if container.is_running() && !force {
            return Err(StevedoreError::Engine(format!(
                "Cannot remove running container {}",
                container.name()
            )));
        }

        let removed = containers.remove(id)
            .ok_or_else(|| StevedoreError::ContainerNotFound(id.to_string()))?;
        self.persist(&containers)?;

        Ok(removed)
    }

    /// Get container by ID
    pub fn get(&self, id: &str) -> Result<Container> {
        let containers = self.containers.read()
            .map_err(|_| StevedoreError::Lock("Failed to acquire read lock".to_string()))?;

        containers.get(id)
            .cloned()
            .ok_or_else(|| StevedoreError::ContainerNotFound(id.to_string()))
    }

    /// List containers, optionally only running ones
    pub fn list(&self, all: bool) -> Result<Vec<Container>> {
        let containers = self.containers.read()
            .map_err(|_| StevedoreError::Lock("Failed to acquire read lock".to_string()))?;

        let mut result: Vec<Container> = containers.values()
            .filter(|c| all || c.status == ContainerStatus::Running)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.config.name.cmp(&b.config.name));

        Ok(result)
    }

    /// Containers carrying `key=value`
    pub fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<Container>> {
        Ok(self.list(true)?
            .into_iter()
            .filter(|c| c.config.labels.get(key).map(String::as_str) == Some(value))
            .collect())
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Container) -> Result<()>) -> Result<()> {
        let mut containers = self.containers.write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        let container = containers.get_mut(id)
            .ok_or_else(|| StevedoreError::ContainerNotFound(id.to_string()))?;
        f(container)?;

        self.persist(&containers)
    }

    fn persist(&self, containers: &BTreeMap<String, Container>) -> Result<()> {
        index::save(&self.base_path.join(INDEX_FILE), containers)
    }
}

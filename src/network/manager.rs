//! Network manager for the local engine

use super::config::{Endpoint, Network};
use crate::error::{Result, StevedoreError};
use crate::storage::index;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

const INDEX_FILE: &str = "networks.json";

/// Network manager for handling all networks
pub struct NetworkManager {
    /// Networks indexed by name
    networks: Arc<RwLock<BTreeMap<String, Network>>>,
    /// Directory holding the index file
    base_path: PathBuf,
}

impl NetworkManager {
    /// Open the network index under `base_path`
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        let networks = index::load(&base_path.join(INDEX_FILE))?;

        Ok(Self {
            networks: Arc::new(RwLock::new(networks)),
            base_path,
        })
    }

    /// Make sure a network exists; returns it and whether this call created it
    pub fn ensure(&self, template: Network) -> Result<(Network, bool)> {
        let mut networks = self.networks.write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        if let Some(existing) = networks.get(&template.name) {
            return Ok((existing.clone(), false));
        }

        let mut network = template;
        network.endpoints.clear();
        networks.insert(network.name.clone(), network.clone());
        self.persist(&networks)?;

        tracing::debug!("Created network {} ({})", network.name, network.id);
        Ok((network, true))
    }

    /// Remove a network that has no connected containers
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut networks = self.networks.write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        let network = networks.get(name)
            .ok_or_else(|| StevedoreError::NetworkNotFound(name.to_string()))?;

        if !network.endpoints.is_empty() {
            return Err(StevedoreError::Engine(format!(
                "Network {} has active endpoints: {}",
                name,
                network.endpoints.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }

        networks.remove(name);
        self.persist(&networks)
    }

    /// Get a network by name
    pub fn get(&self, name: &str) -> Result<Network> {
        let networks = self.networks.read()
            .map_err(|_| StevedoreError::Lock("Failed to acquire read lock".to_string()))?;

        networks.get(name)
            .cloned()
            .ok_or_else(|| StevedoreError::NetworkNotFound(name.to_string()))
    }

    /// Whether a network exists
    pub fn exists(&self, name: &str) -> Result<bool> {
        let networks = self.networks.read()
            .map_err(|_| StevedoreError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(networks.contains_key(name))
    }

    /// List all networks
    pub fn list(&self) -> Result<Vec<Network>> {
        let networks = self.networks.read()
            .map_err(|_| StevedoreError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(networks.values().cloned().collect())
    }

    /// Connect a container to a network under the given aliases
    pub fn connect(&self, network: &str, container: &str, aliases: Vec<String>) -> Result<()> {
        let mut networks = self.networks.write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        let entry = networks.get_mut(network)
            .ok_or_else(|| StevedoreError::NetworkNotFound(network.to_string()))?;

        if let Some(owner) = aliases.iter().find_map(|a| entry.resolve(a)) {
            if owner != container {
                return Err(StevedoreError::Engine(format!(
                    "Alias already taken on network {} by {}",
                    network, owner
                )));
            }
        }

        entry.endpoints.insert(container.to_string(), Endpoint { aliases });
        self.persist(&networks)
    }

    /// Disconnect a container from every network it is attached to
    pub fn disconnect_all(&self, container: &str) -> Result<()> {
        let mut networks = self.networks.write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        let mut changed = false;
        for network in networks.values_mut() {
            changed |= network.endpoints.remove(container).is_some();
        }

        if changed {
            self.persist(&networks)?;
        }
        Ok(())
    }

    fn persist(&self, networks: &BTreeMap<String, Network>) -> Result<()> {
        index::save(&self.base_path.join(INDEX_FILE), networks)
    }
}

//! Volume management
//!
//! Named volumes live under `<base>/volumes/<name>/_data` and are indexed in
//! `<base>/volumes.json`. Bind mount sources are plain host directories.

use super::index;
use crate::error::{Result, StevedoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const INDEX_FILE: &str = "volumes.json";
const DEFAULT_DRIVER: &str = "local";

/// A named volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Volume driver
    pub driver: String,
    /// Mount point on host
    pub mountpoint: PathBuf,
    /// Driver options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Volume labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Containers currently mounting this volume
    #[serde(default)]
    pub users: BTreeSet<String>,
}

impl Volume {
    /// Create a new volume record
    pub fn new(name: &str, base_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            driver: DEFAULT_DRIVER.to_string(),
            mountpoint: base_path.join("volumes").join(name).join("_data"),
            options: BTreeMap::new(),
            labels: BTreeMap::new(),
            created_at: Utc::now(),
            users: BTreeSet::new(),
        }
    }

    /// Set driver
    pub fn driver(mut self, driver: &str) -> Self {
        self.driver = driver.to_string();
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Get size in bytes
    pub fn size(&self) -> Result<u64> {
        if !self.mountpoint.exists() {
            return Ok(0);
        }

        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&self.mountpoint)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }

        Ok(total)
    }
}

/// Volume manager
pub struct VolumeManager {
    /// Volumes indexed by name
    volumes: Arc<RwLock<BTreeMap<String, Volume>>>,
    /// Base path for volume storage
    base_path: PathBuf,
}

impl VolumeManager {
    /// Open the volume index under `base_path`, creating it when absent
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("volumes"))?;
        let volumes = index::load(&base_path.join(INDEX_FILE))?;

        Ok(Self {
            volumes: Arc::new(RwLock::new(volumes)),
            base_path,
        })
    }

    /// Make sure a volume exists
    ///
    /// Returns the volume and whether this call created it. An existing
    /// volume is returned unchanged; its labels and options are not updated.
    pub fn ensure(&self, template: Volume) -> Result<(Volume, bool)> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        if let Some(existing) = volumes.get(&template.name) {
            if !existing.mountpoint.is_dir() {
                create_dir(&existing.name, &existing.mountpoint)?;
            }
            return Ok((existing.clone(), false));
        }

        let mut volume = template;
        volume.mountpoint = self
            .base_path
            .join("volumes")
            .join(&volume.name)
            .join("_data");
        volume.created_at = Utc::now();
        volume.users.clear();

        create_dir(&volume.name, &volume.mountpoint)?;

        volumes.insert(volume.name.clone(), volume.clone());
        self.persist(&volumes)?;

        tracing::debug!("Created volume {} at {}", volume.name, volume.mountpoint.display());
        Ok((volume, true))
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<Volume> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| StevedoreError::Lock("Failed to acquire read lock".to_string()))?;

        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| StevedoreError::VolumeNotFound(name.to_string()))
    }

    /// Whether a volume exists
    pub fn exists(&self, name: &str) -> Result<bool> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| StevedoreError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(volumes.contains_key(name))
    }

    /// List all volumes, sorted by name
    pub fn list(&self) -> Result<Vec<Volume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| StevedoreError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(volumes.values().cloned().collect())
    }

    /// Remove a volume and its data
    ///
    /// A volume still mounted by a container is only removed with `force`.
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get(name)
            .ok_or_else(|| StevedoreError::VolumeNotFound(name.to_string()))?;

        if !volume.users.is_empty() && !force {
            return Err(StevedoreError::VolumeMount {
                volume: name.to_string(),
                reason: format!(
                    "in use by {}",
                    volume.users.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
            });
        }

        // <base>/volumes/<name>, not just _data
        if let Some(dir) = volume.mountpoint.parent() {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }

        volumes.remove(name);
        self.persist(&volumes)
    }

    /// Record that a container mounts a volume
    pub fn add_reference(&self, name: &str, container: &str) -> Result<()> {
        self.update(name, |v| {
            v.users.insert(container.to_string());
        })
    }

    /// Drop a container's claim on a volume
    pub fn remove_reference(&self, name: &str, container: &str) -> Result<()> {
        self.update(name, |v| {
            v.users.remove(container);
        })
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut Volume)) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| StevedoreError::Lock("Failed to acquire write lock".to_string()))?;

        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| StevedoreError::VolumeNotFound(name.to_string()))?;
        f(volume);

        self.persist(&volumes)
    }

    fn persist(&self, volumes: &BTreeMap<String, Volume>) -> Result<()> {
        index::save(&self.base_path.join(INDEX_FILE), volumes)
    }
}

/// Make sure a bind mount source directory exists on the host
pub fn ensure_host_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        // files may be bind mounted as-is
        return Ok(());
    }
    create_dir(&path.display().to_string(), path)
}

fn create_dir(volume: &str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| StevedoreError::VolumeMount {
        volume: volume.to_string(),
        reason: format!("cannot create {}: {}", path.display(), e),
    })
}

//! State-only engine
//!
//! Records networks, volumes and containers in JSON index files under the
//! data directory and creates real volume directories. No processes are
//! launched; a "running" container is a state flag.

use super::{
    ContainerSummary, Engine, NetworkRequest, VolumeRequest, VolumeSummary,
};
use crate::compose::resolve::BuildSpec;
use crate::container::config::{ContainerConfig, MountSource, LABEL_PROJECT};
use crate::container::{Container, ContainerManager};
use crate::error::{Result, StevedoreError};
use crate::network::{Network, NetworkManager};
use crate::storage::{Volume, VolumeManager};
use async_trait::async_trait;
use std::path::PathBuf;

/// Engine backed by local state files
pub struct LocalEngine {
    containers: ContainerManager,
    volumes: VolumeManager,
    networks: NetworkManager,
    data_dir: PathBuf,
}

impl LocalEngine {
    /// Open (or initialise) the state under `data_dir`
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            containers: ContainerManager::new(data_dir.clone())?,
            volumes: VolumeManager::new(data_dir.clone())?,
            networks: NetworkManager::new(data_dir.clone())?,
            data_dir,
        })
    }

    /// Volume records, for inspection
    pub fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    /// Network records, for inspection
    pub fn networks(&self) -> &NetworkManager {
        &self.networks
    }

    fn summary(container: Container) -> ContainerSummary {
        let published = container
            .config
            .ports
            .iter()
            .filter_map(|p| p.host_port)
            .collect();
        ContainerSummary {
            id: container.id,
            name: container.config.name,
            status: container.status,
            labels: container.config.labels,
            published,
        }
    }

    /// Another running container already publishing one of this container's host ports
    fn port_holder(&self, container: &Container) -> Result<Option<(u16, String)>> {
        for other in self.containers.list(false)? {
            if other.id == container.id {
                continue;
            }
            for mine in container.config.ports.iter() {
                let Some(port) = mine.host_port else { continue };
                let clash = other.config.ports.iter().any(|theirs| {
                    theirs.host_port == Some(port)
                        && theirs.protocol == mine.protocol
                        && (theirs.host_ip.is_none()
                            || mine.host_ip.is_none()
                            || theirs.host_ip == mine.host_ip)
                });
                if clash {
                    return Ok(Some((port, other.config.name.clone())));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Engine for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn ensure_network(&self, request: &NetworkRequest) -> Result<bool> {
        let mut network = Network::new(&request.name).internal(request.internal);
        if let Some(driver) = &request.driver {
            network = network.driver(driver);
        }
        network.labels = request.labels.clone();

        let (_, created) = self.networks.ensure(network)?;
        Ok(created)
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        self.networks.exists(name)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        match self.networks.remove(name) {
            Err(StevedoreError::NetworkNotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn ensure_volume(&self, request: &VolumeRequest) -> Result<bool> {
        let mut volume = Volume::new(&request.name, &self.data_dir);
        if let Some(driver) = &request.driver {
            volume = volume.driver(driver);
        }
        volume.options = request.driver_opts.clone();
        volume.labels = request.labels.clone();

        let (_, created) = self.volumes.ensure(volume)?;
        Ok(created)
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        self.volumes.exists(name)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.volumes.remove(name, false)
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        let mut summaries = Vec::new();
        for volume in self.volumes.list()? {
            let size = volume.size()?;
            summaries.push(VolumeSummary {
                name: volume.name,
                driver: volume.driver,
                mountpoint: Some(volume.mountpoint),
                labels: volume.labels,
                size: Some(size),
            });
        }
        Ok(summaries)
    }

    async fn list_containers(&self, project: &str) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .containers
            .list_by_label(LABEL_PROJECT, project)?
            .into_iter()
            .map(Self::summary)
            .collect())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        for mount in &config.mounts {
            match &mount.source {
                MountSource::Volume(name) => {
                    if !self.volumes.exists(name)? {
                        return Err(StevedoreError::VolumeMount {
                            volume: name.clone(),
                            reason: "volume does not exist".to_string(),
                        });
                    }
                }
                MountSource::Bind(path) => {
                    if !path.exists() {
                        return Err(StevedoreError::VolumeMount {
                            volume: path.display().to_string(),
                            reason: "bind source does not exist".to_string(),
                        });
                    }
                }
            }
        }
        for attachment in &config.networks {
            if !self.networks.exists(&attachment.network)? {
                return Err(StevedoreError::NetworkNotFound(attachment.network.clone()));
            }
        }

        let container = self.containers.create(config.clone())?;

        for mount in &config.mounts {
            if let MountSource::Volume(name) = &mount.source {
                self.volumes.add_reference(name, &config.name)?;
            }
        }
        for attachment in &config.networks {
            self.networks
                .connect(&attachment.network, &config.name, attachment.aliases.clone())?;
        }

        tracing::debug!("Created container {} ({})", config.name, container.id);
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let container = self.containers.get(id)?;
        if let Some((port, holder)) = self.port_holder(&container)? {
            return Err(StevedoreError::PortConflict {
                service: container.config.name.clone(),
                port,
                reason: format!("already published by {}", holder),
            });
        }
        self.containers.start(id)
    }

    async fn stop_container(&self, id: &str, _timeout: Option<u64>) -> Result<()> {
        self.containers.stop(id)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let removed = self.containers.remove(id, true)?;

        for mount in &removed.config.mounts {
            if let MountSource::Volume(name) = &mount.source {
                match self.volumes.remove_reference(name, removed.name()) {
                    Ok(()) | Err(StevedoreError::VolumeNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.networks.disconnect_all(removed.name())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        // images are not managed locally
        Ok(true)
    }

    async fn build_image(&self, image: &str, build: &BuildSpec) -> Result<()> {
        if !build.context.is_dir() {
            return Err(StevedoreError::Engine(format!(
                "Build context {} does not exist",
                build.context.display()
            )));
        }
        let dockerfile = build.context.join(build.dockerfile.as_deref().unwrap_or("Dockerfile"));
        if !dockerfile.is_file() {
            return Err(StevedoreError::Engine(format!(
                "Dockerfile {} does not exist",
                dockerfile.display()
            )));
        }

        tracing::info!("Recorded build of {} from {}", image, build.context.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::NetworkAttachment;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn volume_request(name: &str) -> VolumeRequest {
        VolumeRequest {
            name: name.to_string(),
            driver: None,
            driver_opts: BTreeMap::new(),
            labels: BTreeMap::from([(LABEL_PROJECT.to_string(), "quickdish".to_string())]),
        }
    }

    fn network_request(name: &str) -> NetworkRequest {
        NetworkRequest {
            name: name.to_string(),
            driver: None,
            internal: false,
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let temp = tempdir().unwrap();
        let engine = LocalEngine::new(temp.path().to_path_buf()).unwrap();

        assert!(engine.ensure_volume(&volume_request("quickdish_db-data")).await.unwrap());
        assert!(!engine.ensure_volume(&volume_request("quickdish_db-data")).await.unwrap());

        let volumes = engine.list_volumes().await.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].project(), Some("quickdish"));
        assert_eq!(volumes[0].size, Some(0));
        assert!(temp.path().join("volumes/quickdish_db-data/_data").is_dir());

        std::fs::write(temp.path().join("volumes/quickdish_db-data/_data/PG_VERSION"), "16\n")
            .unwrap();
        assert_eq!(engine.list_volumes().await.unwrap()[0].size, Some(3));

        engine.remove_volume("quickdish_db-data").await.unwrap();
        assert!(!engine.volume_exists("quickdish_db-data").await.unwrap());
    }

    #[tokio::test]
    async fn test_container_needs_its_volume() {
        let temp = tempdir().unwrap();
        let engine = LocalEngine::new(temp.path().to_path_buf()).unwrap();

        let config = ContainerConfig::new("quickdish-db-1", "postgres:16")
            .volume("quickdish_db-data", "/var/lib/postgresql/data");
        let err = engine.create_container(&config).await.unwrap_err();
        assert!(matches!(err, StevedoreError::VolumeMount { .. }));

        engine.ensure_volume(&volume_request("quickdish_db-data")).await.unwrap();
        let id = engine.create_container(&config).await.unwrap();
        assert_eq!(
            engine.volumes().get("quickdish_db-data").unwrap().users.len(),
            1
        );

        // in use
        assert!(engine.remove_volume("quickdish_db-data").await.is_err());
        engine.remove_container(&id).await.unwrap();
        engine.remove_volume("quickdish_db-data").await.unwrap();
    }

    #[tokio::test]
    async fn test_network_aliases() {
        let temp = tempdir().unwrap();
        let engine = LocalEngine::new(temp.path().to_path_buf()).unwrap();
        assert!(engine.ensure_network(&network_request("quickdish_default")).await.unwrap());

        let mut config = ContainerConfig::new("quickdish-db-1", "postgres:16")
            .label(LABEL_PROJECT, "quickdish");
        config.networks.push(NetworkAttachment {
            network: "quickdish_default".to_string(),
            aliases: vec!["db".to_string()],
        });
        let id = engine.create_container(&config).await.unwrap();

        let network = engine.networks().get("quickdish_default").unwrap();
        assert_eq!(network.resolve("db"), Some("quickdish-db-1"));

        assert!(engine.remove_network("quickdish_default").await.is_err());
        engine.remove_container(&id).await.unwrap();
        engine.remove_network("quickdish_default").await.unwrap();
        engine.remove_network("quickdish_default").await.unwrap();
    }

    #[tokio::test]
    async fn test_published_port_clash() {
        let temp = tempdir().unwrap();
        let engine = LocalEngine::new(temp.path().to_path_buf()).unwrap();

        let first = engine
            .create_container(&ContainerConfig::new("a-web-1", "nginx").port(8080, 80))
            .await
            .unwrap();
        let second = engine
            .create_container(&ContainerConfig::new("b-web-1", "nginx").port(8080, 80))
            .await
            .unwrap();

        engine.start_container(&first).await.unwrap();
        let listed = engine.containers.list(false).unwrap();
        let running = LocalEngine::summary(listed.into_iter().next().unwrap());
        assert_eq!(running.published, vec![8080]);
        assert!(running.holds_port(8080));
        assert!(!running.holds_port(8081));

        let err = engine.start_container(&second).await.unwrap_err();
        assert!(matches!(err, StevedoreError::PortConflict { port: 8080, .. }));

        engine.stop_container(&first, None).await.unwrap();
        engine.start_container(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_containers_by_project() {
        let temp = tempdir().unwrap();
        let engine = LocalEngine::new(temp.path().to_path_buf()).unwrap();

        engine
            .create_container(&ContainerConfig::new("q-db-1", "postgres").label(LABEL_PROJECT, "q"))
            .await
            .unwrap();
        engine
            .create_container(&ContainerConfig::new("o-db-1", "postgres").label(LABEL_PROJECT, "o"))
            .await
            .unwrap();

        let listed = engine.list_containers("q").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "q-db-1");
        assert!(!listed[0].is_running());
    }

    #[tokio::test]
    async fn test_build_requires_context() {
        let temp = tempdir().unwrap();
        let engine = LocalEngine::new(temp.path().join("state")).unwrap();

        let build = BuildSpec {
            context: temp.path().join("app"),
            dockerfile: None,
            args: BTreeMap::new(),
            target: None,
        };
        assert!(engine.build_image("quickdish-api", &build).await.is_err());

        std::fs::create_dir(temp.path().join("app")).unwrap();
        assert!(engine.build_image("quickdish-api", &build).await.is_err());

        std::fs::write(temp.path().join("app/Dockerfile"), "FROM python:3.12\n").unwrap();
        engine.build_image("quickdish-api", &build).await.unwrap();
    }
}

//! Container engine abstraction
//!
//! The orchestrator only talks to an [`Engine`]; the `docker` CLI and the
//! state-only local engine both sit behind it.

pub mod docker;
pub mod local;

use crate::compose::resolve::BuildSpec;
use crate::container::config::{
    ContainerConfig, ContainerStatus, LABEL_CONFIG_HASH, LABEL_CONTAINER_NUMBER, LABEL_PROJECT,
    LABEL_SERVICE,
};
use crate::error::Result;
use crate::settings::{EngineKind, EngineSettings};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use docker::DockerEngine;
pub use local::LocalEngine;

/// A network the orchestrator wants to exist
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRequest {
    pub name: String,
    pub driver: Option<String>,
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
}

/// A volume the orchestrator wants to exist
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRequest {
    pub name: String,
    pub driver: Option<String>,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// A volume as reported by an engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeSummary {
    pub name: String,
    pub driver: String,
    pub mountpoint: Option<PathBuf>,
    pub labels: BTreeMap<String, String>,
    /// Bytes stored, when the engine can tell
    pub size: Option<u64>,
}

impl VolumeSummary {
    /// Project that owns the volume, from its labels
    pub fn project(&self) -> Option<&str> {
        self.labels.get(LABEL_PROJECT).map(String::as_str)
    }
}

/// A project container as reported by an engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
    /// Host ports the container publishes
    pub published: Vec<u16>,
}

impl ContainerSummary {
    /// Service the container belongs to
    pub fn service(&self) -> Option<&str> {
        self.labels.get(LABEL_SERVICE).map(String::as_str)
    }

    /// Configuration hash recorded at creation
    pub fn config_hash(&self) -> Option<&str> {
        self.labels.get(LABEL_CONFIG_HASH).map(String::as_str)
    }

    /// Replica number within the service
    pub fn number(&self) -> u32 {
        self.labels
            .get(LABEL_CONTAINER_NUMBER)
            .and_then(|n| n.parse().ok())
            .unwrap_or(1)
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Whether the container is running and holds `port` on the host
    pub fn holds_port(&self, port: u16) -> bool {
        self.is_running() && self.published.contains(&port)
    }
}

/// Backend that materialises networks, volumes and containers
///
/// Implementations must be `Send + Sync`; the orchestrator awaits every
/// call before issuing the next.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Create a network unless it exists. Returns whether it was created.
    async fn ensure_network(&self, request: &NetworkRequest) -> Result<bool>;

    async fn network_exists(&self, name: &str) -> Result<bool>;

    /// Remove a network. Removing a missing network is not an error.
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Create a volume unless it exists. Returns whether it was created.
    async fn ensure_volume(&self, request: &VolumeRequest) -> Result<bool>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;

    /// Remove a volume and its data
    async fn remove_volume(&self, name: &str) -> Result<()>;

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>>;

    /// Containers labelled with the given project, running or not
    async fn list_containers(&self, project: &str) -> Result<Vec<ContainerSummary>>;

    /// Create a container and return its ID
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container, waiting up to `timeout` seconds before killing it
    async fn stop_container(&self, id: &str, timeout: Option<u64>) -> Result<()>;

    /// Remove a container, stopping it first if needed
    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Build `image` from a build context
    async fn build_image(&self, image: &str, build: &BuildSpec) -> Result<()>;
}

/// Engine selected by the settings
pub fn connect(settings: &EngineSettings) -> Result<Arc<dyn Engine>> {
    let engine: Arc<dyn Engine> = match settings.kind {
        EngineKind::Docker => Arc::new(DockerEngine::new()),
        EngineKind::Local => Arc::new(LocalEngine::new(settings.data_dir.clone())?),
    };
    tracing::debug!("Using {} engine", engine.name());
    Ok(engine)
}

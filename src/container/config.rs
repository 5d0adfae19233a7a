//! Container configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Label carrying the project name
pub const LABEL_PROJECT: &str = "com.docker.compose.project";
/// Label carrying the service name
pub const LABEL_SERVICE: &str = "com.docker.compose.service";
/// Label carrying the replica number
pub const LABEL_CONTAINER_NUMBER: &str = "com.docker.compose.container-number";
/// Label carrying the configuration hash
pub const LABEL_CONFIG_HASH: &str = "com.docker.compose.config-hash";
/// Label carrying a volume or network key as written in the descriptor
pub const LABEL_VOLUME: &str = "com.docker.compose.volume";
pub const LABEL_NETWORK: &str = "com.docker.compose.network";

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container is paused
    Paused,
    /// Container is restarting
    Restarting,
    /// Container has exited
    Exited,
    /// Container is being removed
    Removing,
    /// Container is in an error state
    Dead,
}

impl ContainerStatus {
    /// Parse the state word printed by `docker ps`
    pub fn from_state(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Exited,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Removing => write!(f, "removing"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Container configuration handed to an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name
    pub name: String,
    /// Image name/tag
    pub image: String,
    /// Command to run
    pub cmd: Vec<String>,
    /// Entry point
    pub entrypoint: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// User to run as
    pub user: Option<String>,
    /// Hostname
    pub hostname: Option<String>,
    /// Published ports
    pub ports: Vec<PortMapping>,
    /// Ports reachable on the project network only
    pub expose: Vec<u16>,
    /// Volume mounts
    pub mounts: Vec<VolumeMount>,
    /// Networks to join
    pub networks: Vec<NetworkAttachment>,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Restart policy
    pub restart: Option<String>,
}

impl ContainerConfig {
    /// Create a new container configuration
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            ..Self::default()
        }
    }

    /// Set command to run
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Add port mapping
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping {
            host_ip: None,
            host_port: Some(host_port),
            container_port,
            protocol: Protocol::Tcp,
        });
        self
    }

    /// Add a named volume mount
    pub fn volume(mut self, volume: &str, container_path: &str) -> Self {
        self.mounts.push(VolumeMount {
            source: MountSource::Volume(volume.to_string()),
            target: container_path.to_string(),
            read_only: false,
        });
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// SHA-256 over everything except the config-hash label itself
    pub fn config_hash(&self) -> Result<String> {
        let mut hashed = self.clone();
        hashed.labels.remove(LABEL_CONFIG_HASH);
        let bytes = serde_json::to_vec(&hashed)?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

/// Port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host address to bind; all interfaces when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Host port; engine-assigned when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            if ip.contains(':') {
                write!(f, "[{}]:", ip)?;
            } else {
                write!(f, "{}:", ip)?;
            }
        }
        match self.host_port {
            Some(port) => write!(f, "{}:", port)?,
            None if self.host_ip.is_some() => write!(f, ":")?,
            None => {}
        }
        write!(f, "{}/{}", self.container_port, self.protocol)
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Where a mount's data comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "source")]
pub enum MountSource {
    /// Named volume
    Volume(String),
    /// Host directory
    Bind(PathBuf),
}

/// Volume mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            MountSource::Volume(name) => write!(f, "{}:{}", name, self.target)?,
            MountSource::Bind(path) => write!(f, "{}:{}", path.display(), self.target)?,
        }
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

/// Network membership of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network name as known to the engine
    pub network: String,
    /// DNS aliases on that network
    pub aliases: Vec<String>,
}

//! Compose orchestrator
//!
//! Drives an [`Engine`] from a [`ResolvedProject`]: preflight, networks,
//! volumes, then one container per service in dependency order.

use super::order;
use super::resolve::{ResolvedProject, ServiceSpec};
use crate::container::config::{
    ContainerConfig, MountSource, NetworkAttachment, PortMapping, VolumeMount, LABEL_CONFIG_HASH,
    LABEL_CONTAINER_NUMBER, LABEL_NETWORK, LABEL_PROJECT, LABEL_SERVICE, LABEL_VOLUME,
};
use crate::engine::{ContainerSummary, Engine, NetworkRequest, VolumeRequest};
use crate::error::{Result, StevedoreError};
use crate::network::port::probe_host_port;
use crate::storage::ensure_host_dir;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// What `up` did to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    /// No container existed; one was created and started
    Created,
    /// The configuration changed; the container was replaced
    Recreated,
    /// An up-to-date container was stopped and has been started
    Started,
    /// An up-to-date container was already running
    UpToDate,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAction::Created => write!(f, "created"),
            ServiceAction::Recreated => write!(f, "recreated"),
            ServiceAction::Started => write!(f, "started"),
            ServiceAction::UpToDate => write!(f, "up-to-date"),
        }
    }
}

/// Options for [`ComposeOrchestrator::up`]
#[derive(Debug, Clone)]
pub struct UpOptions {
    /// Build every `build:` service even when its image exists
    pub build: bool,
    /// Probe published host ports before starting anything
    pub check_ports: bool,
    /// Services to bring up (with their dependencies); empty means all
    pub services: Vec<String>,
}

impl Default for UpOptions {
    fn default() -> Self {
        Self {
            build: false,
            check_ports: true,
            services: Vec::new(),
        }
    }
}

/// Outcome of [`ComposeOrchestrator::up`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpReport {
    pub networks_created: Vec<String>,
    pub volumes_created: Vec<String>,
    /// Services in start order
    pub services: Vec<(String, ServiceAction)>,
}

/// Outcome of [`ComposeOrchestrator::down`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownReport {
    pub containers_removed: Vec<String>,
    pub networks_removed: Vec<String>,
    pub volumes_removed: Vec<String>,
}

/// Compose orchestrator
pub struct ComposeOrchestrator {
    project: ResolvedProject,
    engine: Arc<dyn Engine>,
}

impl ComposeOrchestrator {
    /// Create a new orchestrator
    pub fn new(project: ResolvedProject, engine: Arc<dyn Engine>) -> Self {
        Self { project, engine }
    }

    /// The project being orchestrated
    pub fn project(&self) -> &ResolvedProject {
        &self.project
    }

    /// Bring the project (or the selected services) up
    pub async fn up(&self, options: &UpOptions) -> Result<UpReport> {
        tracing::info!("Starting compose project: {}", self.project.name);

        let order = order::start_order_for(&self.project, &options.services)?;
        let existing = self.existing_containers().await?;

        let mut desired = Vec::with_capacity(order.len());
        for name in &order {
            let service = self.project.service(name)?;
            desired.push((service, self.container_config(service)?));
        }

        self.check_ports(&desired, &existing, options.check_ports)?;

        let mut report = UpReport {
            networks_created: self.ensure_networks(&order).await?,
            volumes_created: self.ensure_volumes(&order).await?,
            services: Vec::with_capacity(order.len()),
        };

        for (service, config) in desired {
            self.build_if_needed(service, options.build).await?;
            let action = self
                .converge(service, config, existing.get(&service.name))
                .await?;
            tracing::info!("Service {} {}", service.name, action);
            report.services.push((service.name.clone(), action));
        }

        Ok(report)
    }

    /// Stop and remove the project's containers and networks
    ///
    /// Named volumes are kept unless `remove_volumes` is set. External
    /// networks and volumes are never removed.
    pub async fn down(&self, remove_volumes: bool, timeout: Option<u64>) -> Result<DownReport> {
        tracing::info!("Stopping compose project: {}", self.project.name);

        let mut report = DownReport::default();
        for container in self.containers_in_stop_order().await? {
            if container.is_running() {
                self.engine.stop_container(&container.id, timeout).await?;
            }
            self.engine.remove_container(&container.id).await?;
            report.containers_removed.push(container.name);
        }

        for network in self.project.networks.values().filter(|n| !n.external) {
            if self.engine.network_exists(&network.name).await? {
                self.engine.remove_network(&network.name).await?;
                report.networks_removed.push(network.name.clone());
            }
        }

        if remove_volumes {
            for volume in self.project.volumes.values().filter(|v| !v.external) {
                if self.engine.volume_exists(&volume.name).await? {
                    self.engine.remove_volume(&volume.name).await?;
                    report.volumes_removed.push(volume.name.clone());
                }
            }
        }

        Ok(report)
    }

    /// Start existing containers of the selected services and their dependencies
    pub async fn start(&self, services: &[String]) -> Result<Vec<String>> {
        let order = order::start_order_for(&self.project, services)?;
        let existing = self.existing_containers().await?;

        let mut started = Vec::new();
        for name in order {
            let container = existing.get(&name).ok_or_else(|| StevedoreError::ServiceStart {
                service: name.clone(),
                reason: "no container exists; run `up` first".to_string(),
            })?;
            if container.is_running() {
                continue;
            }
            let service = self.project.service(&name)?;
            self.start_container(service, &container.id).await?;
            started.push(name);
        }

        Ok(started)
    }

    /// Stop running containers of the selected services (all when empty)
    pub async fn stop(&self, services: &[String], timeout: Option<u64>) -> Result<Vec<String>> {
        let selected: BTreeSet<&str> = services.iter().map(String::as_str).collect();
        for name in services {
            self.project.service(name)?;
        }

        let mut stopped = Vec::new();
        for container in self.containers_in_stop_order().await? {
            let Some(service) = container.service() else { continue };
            if !selected.is_empty() && !selected.contains(service) {
                continue;
            }
            if container.is_running() {
                self.engine.stop_container(&container.id, timeout).await?;
                stopped.push(service.to_string());
            }
        }

        Ok(stopped)
    }

    /// Stop then start the selected services
    pub async fn restart(&self, services: &[String], timeout: Option<u64>) -> Result<Vec<String>> {
        self.stop(services, timeout).await?;

        let targets: Vec<String> = if services.is_empty() {
            order::start_order(&self.project)?
        } else {
            order::start_order(&self.project)?
                .into_iter()
                .filter(|s| services.contains(s))
                .collect()
        };

        let existing = self.existing_containers().await?;
        let mut restarted = Vec::new();
        for name in targets {
            let Some(container) = existing.get(&name) else { continue };
            let service = self.project.service(&name)?;
            self.start_container(service, &container.id).await?;
            restarted.push(name);
        }

        Ok(restarted)
    }

    /// The project's containers, sorted by name
    pub async fn ps(&self) -> Result<Vec<ContainerSummary>> {
        let mut containers = self.engine.list_containers(&self.project.name).await?;
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    /// Container name for a service
    pub fn container_name(&self, service: &ServiceSpec) -> String {
        service
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-1", self.project.name, service.name))
    }

    /// Container configuration for a service, config-hash label included
    pub fn container_config(&self, service: &ServiceSpec) -> Result<ContainerConfig> {
        let mut mounts = Vec::with_capacity(service.mounts.len());
        for mount in &service.mounts {
            let source = match &mount.source {
                MountSource::Volume(key) => MountSource::Volume(self.project.volume(key)?.name.clone()),
                MountSource::Bind(path) => MountSource::Bind(path.clone()),
            };
            mounts.push(VolumeMount {
                source,
                target: mount.target.clone(),
                read_only: mount.read_only,
            });
        }

        let mut networks = Vec::with_capacity(service.networks.len());
        for (key, extra) in &service.networks {
            let mut aliases = vec![service.name.clone()];
            aliases.extend(extra.iter().filter(|a| **a != service.name).cloned());
            networks.push(NetworkAttachment {
                network: self.project.network(key)?.name.clone(),
                aliases,
            });
        }

        let mut labels = service.labels.clone();
        labels.insert(LABEL_PROJECT.to_string(), self.project.name.clone());
        labels.insert(LABEL_SERVICE.to_string(), service.name.clone());
        labels.insert(LABEL_CONTAINER_NUMBER.to_string(), "1".to_string());

        let mut config = ContainerConfig {
            name: self.container_name(service),
            image: service.image.clone(),
            cmd: service.command.clone(),
            entrypoint: service.entrypoint.clone(),
            env: service.environment.clone(),
            working_dir: service.working_dir.clone(),
            user: service.user.clone(),
            hostname: service.hostname.clone(),
            ports: service.ports.clone(),
            expose: service.expose.clone(),
            mounts,
            networks,
            labels,
            restart: service.restart.clone(),
        };
        let hash = config.config_hash()?;
        config.labels.insert(LABEL_CONFIG_HASH.to_string(), hash);

        Ok(config)
    }

    async fn existing_containers(&self) -> Result<BTreeMap<String, ContainerSummary>> {
        let mut by_service = BTreeMap::new();
        for container in self.engine.list_containers(&self.project.name).await? {
            if container.number() != 1 {
                continue;
            }
            if let Some(service) = container.service() {
                by_service.insert(service.to_string(), container);
            }
        }
        Ok(by_service)
    }

    /// Project containers, dependents before their dependencies
    async fn containers_in_stop_order(&self) -> Result<Vec<ContainerSummary>> {
        let rank: BTreeMap<String, usize> = order::stop_order(&self.project)?
            .into_iter()
            .enumerate()
            .map(|(i, s)| (s, i))
            .collect();

        let mut containers = self.engine.list_containers(&self.project.name).await?;
        // orphans (services no longer declared) go first
        containers.sort_by_key(|c| {
            (
                c.service().and_then(|s| rank.get(s)).map_or(0, |r| r + 1),
                c.name.clone(),
            )
        });
        Ok(containers)
    }

    fn check_ports(
        &self,
        desired: &[(&ServiceSpec, ContainerConfig)],
        existing: &BTreeMap<String, ContainerSummary>,
        probe: bool,
    ) -> Result<()> {
        let mut claimed: Vec<(&str, &PortMapping)> = Vec::new();

        for (service, config) in desired {
            for port in config.ports.iter() {
                let Some(host_port) = port.host_port else { continue };
                if let Some((owner, _)) = claimed.iter().find(|(_, p)| overlaps(p, port)) {
                    return Err(StevedoreError::PortConflict {
                        service: service.name.clone(),
                        port: host_port,
                        reason: format!("also published by service '{}'", owner),
                    });
                }
                claimed.push((service.name.as_str(), port));
            }
        }

        if !probe {
            return Ok(());
        }

        for (service, config) in desired {
            let running = existing.get(&service.name).filter(|c| c.is_running());
            let hash = config.labels.get(LABEL_CONFIG_HASH).map(String::as_str);
            if running.is_some_and(|c| c.config_hash() == hash) {
                continue;
            }
            for port in &config.ports {
                // still held by the container about to be replaced
                if running.is_some_and(|c| port.host_port.is_some_and(|p| c.holds_port(p))) {
                    continue;
                }
                if let Err(reason) = probe_host_port(port) {
                    return Err(StevedoreError::PortConflict {
                        service: service.name.clone(),
                        port: port.host_port.unwrap_or_default(),
                        reason,
                    });
                }
            }
        }

        Ok(())
    }

    async fn ensure_networks(&self, order: &[String]) -> Result<Vec<String>> {
        let mut keys = BTreeSet::new();
        for name in order {
            keys.extend(self.project.service(name)?.networks.keys().cloned());
        }

        let mut created = Vec::new();
        for key in keys {
            let network = self.project.network(&key)?;
            if network.external {
                if !self.engine.network_exists(&network.name).await? {
                    return Err(StevedoreError::Configuration(format!(
                        "External network '{}' does not exist",
                        network.name
                    )));
                }
                continue;
            }

            let mut labels = network.labels.clone();
            labels.insert(LABEL_PROJECT.to_string(), self.project.name.clone());
            labels.insert(LABEL_NETWORK.to_string(), key.clone());
            let request = NetworkRequest {
                name: network.name.clone(),
                driver: network.driver.clone(),
                internal: network.internal,
                labels,
            };
            if self.engine.ensure_network(&request).await? {
                tracing::info!("Network {} created", network.name);
                created.push(network.name.clone());
            }
        }

        Ok(created)
    }

    async fn ensure_volumes(&self, order: &[String]) -> Result<Vec<String>> {
        let mut keys = BTreeSet::new();
        for name in order {
            let service = self.project.service(name)?;
            keys.extend(service.volume_keys().map(String::from));

            for mount in &service.mounts {
                if let MountSource::Bind(path) = &mount.source {
                    ensure_host_dir(path)?;
                }
            }
        }

        let mut created = Vec::new();
        for key in keys {
            let volume = self.project.volume(&key)?;
            let mount_error = |reason: String| StevedoreError::VolumeMount {
                volume: volume.name.clone(),
                reason,
            };

            if volume.external {
                if !self.engine.volume_exists(&volume.name).await? {
                    return Err(mount_error("external volume does not exist".to_string()));
                }
                continue;
            }

            let mut labels = volume.labels.clone();
            labels.insert(LABEL_PROJECT.to_string(), self.project.name.clone());
            labels.insert(LABEL_VOLUME.to_string(), key.clone());
            let request = VolumeRequest {
                name: volume.name.clone(),
                driver: volume.driver.clone(),
                driver_opts: volume.driver_opts.clone(),
                labels,
            };

            match self.engine.ensure_volume(&request).await {
                Ok(true) => {
                    tracing::info!("Volume {} created", volume.name);
                    created.push(volume.name.clone());
                }
                Ok(false) => tracing::debug!("Volume {} exists", volume.name),
                Err(e @ StevedoreError::VolumeMount { .. }) => return Err(e),
                Err(e) => return Err(mount_error(e.to_string())),
            }
        }

        Ok(created)
    }

    async fn build_if_needed(&self, service: &ServiceSpec, force: bool) -> Result<()> {
        let Some(build) = &service.build else {
            return Ok(());
        };

        if !force && self.engine.image_exists(&service.image).await? {
            return Ok(());
        }

        tracing::info!("Building image for service: {}", service.name);
        self.engine
            .build_image(&service.image, build)
            .await
            .map_err(|e| StevedoreError::ServiceStart {
                service: service.name.clone(),
                reason: format!("image build failed: {}", e),
            })
    }

    async fn converge(
        &self,
        service: &ServiceSpec,
        config: ContainerConfig,
        existing: Option<&ContainerSummary>,
    ) -> Result<ServiceAction> {
        let hash = config.labels.get(LABEL_CONFIG_HASH).cloned();

        let action = match existing {
            Some(container) if container.config_hash() == hash.as_deref() => {
                if container.is_running() {
                    return Ok(ServiceAction::UpToDate);
                }
                self.start_container(service, &container.id).await?;
                return Ok(ServiceAction::Started);
            }
            Some(container) => {
                tracing::debug!("Configuration of {} changed; recreating", service.name);
                if container.is_running() {
                    self.engine.stop_container(&container.id, None).await?;
                }
                self.engine.remove_container(&container.id).await?;
                ServiceAction::Recreated
            }
            None => ServiceAction::Created,
        };

        let id = self
            .engine
            .create_container(&config)
            .await
            .map_err(|e| start_error(service, e))?;
        self.start_container(service, &id).await?;

        Ok(action)
    }

    async fn start_container(&self, service: &ServiceSpec, id: &str) -> Result<()> {
        self.engine
            .start_container(id)
            .await
            .map_err(|e| start_error(service, e))
    }
}

/// Whether two published ports would bind the same host socket
fn overlaps(a: &PortMapping, b: &PortMapping) -> bool {
    a.host_port.is_some()
        && a.host_port == b.host_port
        && a.protocol == b.protocol
        && (a.host_ip.is_none() || b.host_ip.is_none() || a.host_ip == b.host_ip)
}

/// Classify an engine failure while creating or starting a service
fn start_error(service: &ServiceSpec, err: StevedoreError) -> StevedoreError {
    match err {
        e @ (StevedoreError::PortConflict { .. } | StevedoreError::VolumeMount { .. }) => e,
        e => {
            let reason = e.to_string();
            let lowered = reason.to_lowercase();
            if lowered.contains("port is already allocated") || lowered.contains("address already in use") {
                let port = service
                    .ports
                    .iter()
                    .filter_map(|p| p.host_port)
                    .find(|p| reason.contains(&p.to_string()))
                    .or_else(|| service.ports.iter().find_map(|p| p.host_port))
                    .unwrap_or_default();
                return StevedoreError::PortConflict {
                    service: service.name.clone(),
                    port,
                    reason,
                };
            }
            StevedoreError::ServiceStart {
                service: service.name.clone(),
                reason,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::env::Environment;
    use crate::compose::parser::ComposeParser;
    use crate::compose::resolve::{BuildSpec, Resolver};
    use crate::engine::{LocalEngine, VolumeSummary};
    use std::net::TcpListener;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    const QUICKDISH: &str = include_str!("../../deploy/compose.yaml");

    fn quickdish_env(port: u16) -> Environment {
        Environment::new()
            .with("FORWARD_PORT", &port.to_string())
            .with("CONTAINER_PORT", "80")
            .with("DB_USER", "alice")
            .with("DB_PASSWORD", "secret")
            .with("DB_NAME", "quickdish")
            .with("DB_PORT", "5432")
            .with("JWT_SECRET", "jwt-signing-secret")
    }

    /// Project directory with a Dockerfile, plus a free host port
    fn workspace() -> (TempDir, u16) {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("Dockerfile"), "FROM python:3.12\n").unwrap();
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        (temp, port)
    }

    fn resolve(dir: &Path, env: &Environment) -> Result<ResolvedProject> {
        let parsed = ComposeParser::parse_str(QUICKDISH, env)?;
        Resolver::new(env, dir).resolve(parsed)
    }

    fn orchestrator(dir: &Path, port: u16) -> (ComposeOrchestrator, Arc<LocalEngine>) {
        let engine = Arc::new(LocalEngine::new(dir.join("state")).unwrap());
        let project = resolve(dir, &quickdish_env(port)).unwrap();
        (ComposeOrchestrator::new(project, engine.clone()), engine)
    }

    #[tokio::test]
    async fn test_up_creates_everything_in_order() {
        let (temp, port) = workspace();
        let (orchestrator, engine) = orchestrator(temp.path(), port);

        let report = orchestrator.up(&UpOptions::default()).await.unwrap();
        assert_eq!(
            report.services,
            vec![
                ("db".to_string(), ServiceAction::Created),
                ("api".to_string(), ServiceAction::Created),
            ]
        );
        assert_eq!(report.networks_created, vec!["quickdish_default"]);
        assert_eq!(
            report.volumes_created,
            vec!["quickdish_api-data", "quickdish_db-data"]
        );

        let ps = orchestrator.ps().await.unwrap();
        assert_eq!(ps.len(), 2);
        assert!(ps.iter().all(|c| c.is_running()));

        let network = engine.networks().get("quickdish_default").unwrap();
        assert_eq!(network.resolve("db"), Some("quickdish-db-1"));
    }

    #[tokio::test]
    async fn test_up_is_idempotent() {
        let (temp, port) = workspace();
        let (orchestrator, engine) = orchestrator(temp.path(), port);

        orchestrator.up(&UpOptions::default()).await.unwrap();
        let first: Vec<String> = orchestrator.ps().await.unwrap().into_iter().map(|c| c.id).collect();

        let report = orchestrator.up(&UpOptions::default()).await.unwrap();
        assert!(report.networks_created.is_empty());
        assert!(report.volumes_created.is_empty());
        assert!(report
            .services
            .iter()
            .all(|(_, action)| *action == ServiceAction::UpToDate));

        let second: Vec<String> = orchestrator.ps().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(first, second);
        assert_eq!(engine.list_volumes().await.unwrap().len(), 2);
        assert_eq!(engine.networks().list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_configuration_recreates_only_that_service() {
        let (temp, port) = workspace();
        let (orchestrator, engine) = orchestrator(temp.path(), port);
        orchestrator.up(&UpOptions::default()).await.unwrap();

        let env = quickdish_env(port).with("JWT_SECRET", "rotated");
        let project = resolve(temp.path(), &env).unwrap();
        let report = ComposeOrchestrator::new(project, engine)
            .up(&UpOptions::default())
            .await
            .unwrap();

        assert_eq!(
            report.services,
            vec![
                ("db".to_string(), ServiceAction::UpToDate),
                ("api".to_string(), ServiceAction::Recreated),
            ]
        );
    }

    #[tokio::test]
    async fn test_volumes_persist_across_stop_and_start() {
        let (temp, port) = workspace();
        let (orchestrator, engine) = orchestrator(temp.path(), port);
        orchestrator.up(&UpOptions::default()).await.unwrap();

        let db_data = engine.volumes().get("quickdish_db-data").unwrap();
        std::fs::write(db_data.mountpoint.join("PG_VERSION"), "16").unwrap();

        assert_eq!(
            orchestrator.stop(&["db".to_string()], None).await.unwrap(),
            vec!["db"]
        );
        assert_eq!(orchestrator.start(&["db".to_string()]).await.unwrap(), vec!["db"]);

        let report = orchestrator.up(&UpOptions::default()).await.unwrap();
        assert!(report.volumes_created.is_empty());
        assert_eq!(
            std::fs::read_to_string(db_data.mountpoint.join("PG_VERSION")).unwrap(),
            "16"
        );
    }

    #[tokio::test]
    async fn test_stopped_service_is_started_by_up() {
        let (temp, port) = workspace();
        let (orchestrator, _engine) = orchestrator(temp.path(), port);
        orchestrator.up(&UpOptions::default()).await.unwrap();

        let stopped = orchestrator.stop(&[], None).await.unwrap();
        assert_eq!(stopped, vec!["api", "db"]);

        let report = orchestrator.up(&UpOptions::default()).await.unwrap();
        assert_eq!(
            report.services,
            vec![
                ("db".to_string(), ServiceAction::Started),
                ("api".to_string(), ServiceAction::Started),
            ]
        );
    }

    #[tokio::test]
    async fn test_selected_service_brings_its_dependency() {
        let (temp, port) = workspace();
        let (orchestrator, _engine) = orchestrator(temp.path(), port);

        let options = UpOptions {
            services: vec!["db".to_string()],
            ..UpOptions::default()
        };
        let report = orchestrator.up(&options).await.unwrap();
        assert_eq!(report.services, vec![("db".to_string(), ServiceAction::Created)]);
        assert_eq!(report.volumes_created, vec!["quickdish_db-data"]);

        let options = UpOptions {
            services: vec!["api".to_string()],
            ..UpOptions::default()
        };
        let report = orchestrator.up(&options).await.unwrap();
        assert_eq!(
            report.services,
            vec![
                ("db".to_string(), ServiceAction::UpToDate),
                ("api".to_string(), ServiceAction::Created),
            ]
        );
    }

    #[tokio::test]
    async fn test_down_keeps_volumes_unless_asked() {
        let (temp, port) = workspace();
        let (orchestrator, engine) = orchestrator(temp.path(), port);
        orchestrator.up(&UpOptions::default()).await.unwrap();

        let report = orchestrator.down(false, None).await.unwrap();
        assert_eq!(report.containers_removed, vec!["quickdish-api-1", "quickdish-db-1"]);
        assert_eq!(report.networks_removed, vec!["quickdish_default"]);
        assert!(report.volumes_removed.is_empty());
        assert!(orchestrator.ps().await.unwrap().is_empty());
        assert_eq!(engine.list_volumes().await.unwrap().len(), 2);

        orchestrator.up(&UpOptions::default()).await.unwrap();
        let report = orchestrator.down(true, None).await.unwrap();
        assert_eq!(report.volumes_removed.len(), 2);
        assert!(engine.list_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_variable_creates_nothing() {
        let (temp, port) = workspace();
        let engine = LocalEngine::new(temp.path().join("state")).unwrap();

        let mut env = quickdish_env(port);
        env.unset("DB_PASSWORD");
        let err = resolve(temp.path(), &env).unwrap_err();
        assert!(matches!(err, StevedoreError::UndefinedVariables(ref v) if v == &["DB_PASSWORD"]));
        assert_eq!(err.exit_code(), 78);

        assert!(engine.list_volumes().await.unwrap().is_empty());
        assert!(engine.networks().list().unwrap().is_empty());
        assert!(engine.list_containers("quickdish").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_port_fails_before_anything_starts() {
        let (temp, _) = workspace();
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (orchestrator, engine) = orchestrator(temp.path(), port);

        let err = orchestrator.up(&UpOptions::default()).await.unwrap_err();
        match &err {
            StevedoreError::PortConflict { service, port: p, .. } => {
                assert_eq!(service, "api");
                assert_eq!(*p, port);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(err.exit_code(), 69);
        assert!(engine.list_volumes().await.unwrap().is_empty());
        assert!(orchestrator.ps().await.unwrap().is_empty());

        let options = UpOptions {
            check_ports: false,
            ..UpOptions::default()
        };
        orchestrator.up(&options).await.unwrap();
    }

    #[tokio::test]
    async fn test_moving_to_a_held_port_fails_before_recreating() {
        let (temp, port) = workspace();
        let (orchestrator, engine) = orchestrator(temp.path(), port);
        orchestrator.up(&UpOptions::default()).await.unwrap();
        let before = orchestrator.ps().await.unwrap();

        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let held = listener.local_addr().unwrap().port();
        let project = resolve(temp.path(), &quickdish_env(held)).unwrap();
        let moved = ComposeOrchestrator::new(project, engine.clone());

        let err = moved.up(&UpOptions::default()).await.unwrap_err();
        match &err {
            StevedoreError::PortConflict { service, port: p, .. } => {
                assert_eq!(service, "api");
                assert_eq!(*p, held);
            }
            other => panic!("unexpected error: {}", other),
        }

        // the running api container was left alone
        let after = orchestrator.ps().await.unwrap();
        assert_eq!(before, after);
        assert!(after.iter().all(|c| c.is_running()));
    }

    #[tokio::test]
    async fn test_recreate_keeps_its_own_port() {
        let (temp, port) = workspace();
        let (orchestrator, engine) = orchestrator(temp.path(), port);
        orchestrator.up(&UpOptions::default()).await.unwrap();

        // stand-in for the running api container's own socket
        let _own = TcpListener::bind(("0.0.0.0", port)).unwrap();
        let env = quickdish_env(port).with("JWT_SECRET", "rotated");
        let project = resolve(temp.path(), &env).unwrap();
        let report = ComposeOrchestrator::new(project, engine)
            .up(&UpOptions::default())
            .await
            .unwrap();
        assert_eq!(
            report.services,
            vec![
                ("db".to_string(), ServiceAction::UpToDate),
                ("api".to_string(), ServiceAction::Recreated),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_published_ports_are_rejected() {
        let yaml = r#"
services:
  a:
    image: nginx
    ports: ["18080:80"]
  b:
    image: nginx
    ports: ["127.0.0.1:18080:8080"]
"#;
        let temp = tempdir().unwrap();
        let env = Environment::new();
        let project = Resolver::new(&env, temp.path())
            .resolve(ComposeParser::parse_str(yaml, &env).unwrap())
            .unwrap();
        let engine = Arc::new(LocalEngine::new(temp.path().join("state")).unwrap());

        let options = UpOptions {
            check_ports: false,
            ..UpOptions::default()
        };
        let err = ComposeOrchestrator::new(project, engine)
            .up(&options)
            .await
            .unwrap_err();
        assert!(matches!(err, StevedoreError::PortConflict { port: 18080, .. }));
    }

    #[tokio::test]
    async fn test_external_volume_must_exist() {
        let yaml = r#"
services:
  db:
    image: postgres
    volumes:
      - shared:/data
volumes:
  shared:
    external: true
"#;
        let temp = tempdir().unwrap();
        let env = Environment::new();
        let project = Resolver::new(&env, temp.path())
            .resolve(ComposeParser::parse_str(yaml, &env).unwrap())
            .unwrap();
        let engine = Arc::new(LocalEngine::new(temp.path().join("state")).unwrap());
        let orchestrator = ComposeOrchestrator::new(project, engine.clone());

        let err = orchestrator.up(&UpOptions::default()).await.unwrap_err();
        assert!(matches!(err, StevedoreError::VolumeMount { ref volume, .. } if volume == "shared"));
        assert_eq!(err.exit_code(), 73);

        engine
            .ensure_volume(&VolumeRequest {
                name: "shared".to_string(),
                driver: None,
                driver_opts: BTreeMap::new(),
                labels: BTreeMap::new(),
            })
            .await
            .unwrap();
        let report = orchestrator.up(&UpOptions::default()).await.unwrap();
        assert!(report.volumes_created.is_empty());

        orchestrator.down(true, None).await.unwrap();
        assert!(engine.volume_exists("shared").await.unwrap());
    }

    #[tokio::test]
    async fn test_bind_source_is_created() {
        let yaml = r#"
services:
  api:
    image: api
    volumes:
      - ./uploads:/srv/uploads
"#;
        let temp = tempdir().unwrap();
        let env = Environment::new();
        let project = Resolver::new(&env, temp.path())
            .resolve(ComposeParser::parse_str(yaml, &env).unwrap())
            .unwrap();
        let engine = Arc::new(LocalEngine::new(temp.path().join("state")).unwrap());

        ComposeOrchestrator::new(project, engine)
            .up(&UpOptions::default())
            .await
            .unwrap();
        assert!(temp.path().join("uploads").is_dir());
    }

    #[test]
    fn test_container_config_uses_engine_names() {
        let (temp, port) = workspace();
        let (orchestrator, _engine) = orchestrator(temp.path(), port);
        let api = orchestrator.project().service("api").unwrap();
        let config = orchestrator.container_config(api).unwrap();

        assert_eq!(config.name, "quickdish-api-1");
        assert_eq!(config.image, "quickdish-api");
        assert_eq!(
            config.mounts[0].source,
            MountSource::Volume("quickdish_api-data".to_string())
        );
        assert_eq!(config.networks[0].network, "quickdish_default");
        assert_eq!(config.networks[0].aliases, vec!["api"]);
        assert_eq!(config.labels[LABEL_PROJECT], "quickdish");
        assert_eq!(config.labels[LABEL_SERVICE], "api");
        assert_eq!(config.ports[0].host_port, Some(port));
        assert_eq!(
            config.labels[LABEL_CONFIG_HASH],
            orchestrator.container_config(api).unwrap().config_hash().unwrap()
        );
    }

    /// Engine that records calls and fails to start one service
    struct FailingEngine {
        fail_on: String,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Engine for FailingEngine {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn ensure_network(&self, r: &NetworkRequest) -> Result<bool> {
            self.calls.lock().unwrap().push(format!("network {}", r.name));
            Ok(true)
        }
        async fn network_exists(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn remove_network(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn ensure_volume(&self, r: &VolumeRequest) -> Result<bool> {
            self.calls.lock().unwrap().push(format!("volume {}", r.name));
            Ok(true)
        }
        async fn volume_exists(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn remove_volume(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
            Ok(Vec::new())
        }
        async fn list_containers(&self, _project: &str) -> Result<Vec<ContainerSummary>> {
            Ok(Vec::new())
        }
        async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
            self.calls.lock().unwrap().push(format!("create {}", config.name));
            Ok(config.name.clone())
        }
        async fn start_container(&self, id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("start {}", id));
            if id == self.fail_on {
                return Err(StevedoreError::Engine(
                    "driver failed programming external connectivity: Bind for 0.0.0.0:8080 failed: port is already allocated"
                        .to_string(),
                ));
            }
            if id.contains("db") && self.fail_on == "crash" {
                return Err(StevedoreError::Engine("exec format error".to_string()));
            }
            Ok(())
        }
        async fn stop_container(&self, _id: &str, _t: Option<u64>) -> Result<()> {
            Ok(())
        }
        async fn remove_container(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn image_exists(&self, _image: &str) -> Result<bool> {
            Ok(false)
        }
        async fn build_image(&self, image: &str, _build: &BuildSpec) -> Result<()> {
            self.calls.lock().unwrap().push(format!("build {}", image));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_failures_are_classified() {
        let temp = tempdir().unwrap();
        let project = resolve(temp.path(), &quickdish_env(8080)).unwrap();
        let options = UpOptions {
            check_ports: false,
            ..UpOptions::default()
        };

        let engine = Arc::new(FailingEngine {
            fail_on: "quickdish-api-1".to_string(),
            calls: Mutex::new(Vec::new()),
        });
        let err = ComposeOrchestrator::new(project.clone(), engine.clone())
            .up(&options)
            .await
            .unwrap_err();
        assert!(matches!(err, StevedoreError::PortConflict { port: 8080, .. }));
        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec![
                "network quickdish_default",
                "volume quickdish_api-data",
                "volume quickdish_db-data",
                "create quickdish-db-1",
                "start quickdish-db-1",
                "build quickdish-api",
                "create quickdish-api-1",
                "start quickdish-api-1",
            ]
        );

        let engine = Arc::new(FailingEngine {
            fail_on: "crash".to_string(),
            calls: Mutex::new(Vec::new()),
        });
        let err = ComposeOrchestrator::new(project, engine.clone())
            .up(&options)
            .await
            .unwrap_err();
        assert!(matches!(err, StevedoreError::ServiceStart { ref service, .. } if service == "db"));
        assert_eq!(err.exit_code(), 70);
        assert!(!engine
            .calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.contains("api-1")));
    }
}

//! Engine driving the `docker` CLI

use super::{ContainerSummary, Engine, NetworkRequest, VolumeRequest, VolumeSummary};
use crate::compose::resolve::BuildSpec;
use crate::container::config::{ContainerConfig, ContainerStatus, MountSource, LABEL_PROJECT};
use crate::error::{Result, StevedoreError};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Output;
use std::sync::OnceLock;
use tokio::process::Command;

const DEFAULT_BINARY: &str = "docker";

/// Engine that shells out to the docker CLI
pub struct DockerEngine {
    binary: String,
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerEngine {
    pub fn new() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
        }
    }

    /// Use a different CLI binary (e.g. a docker-compatible one)
    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        tracing::debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| StevedoreError::Engine(format!("Failed to run {}: {}", self.binary, e)))
    }

    /// Run a command and return its stdout, or its stderr as an error
    async fn run(&self, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(StevedoreError::Engine(format!(
            "{} {} failed ({}): {}",
            self.binary,
            args.first().map(String::as_str).unwrap_or_default(),
            output.status.code().unwrap_or(-1),
            stderr
        )))
    }

    /// Whether a command exits successfully
    async fn succeeds(&self, args: &[String]) -> Result<bool> {
        Ok(self.output(args).await?.status.success())
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn is_missing(err: &StevedoreError) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("no such") || message.contains("not found")
}

/// Arguments for `docker create`
pub fn create_args(config: &ContainerConfig) -> Vec<String> {
    let mut out = args(&["create", "--name", &config.name]);

    if let Some(hostname) = &config.hostname {
        out.extend(args(&["--hostname", hostname]));
    }
    if let Some(user) = &config.user {
        out.extend(args(&["--user", user]));
    }
    if let Some(dir) = &config.working_dir {
        out.extend(args(&["--workdir", dir]));
    }
    if let Some(restart) = &config.restart {
        out.extend(args(&["--restart", restart]));
    }
    for (key, value) in &config.env {
        out.push("--env".to_string());
        out.push(format!("{}={}", key, value));
    }
    for port in &config.ports {
        out.push("--publish".to_string());
        out.push(port.to_string());
    }
    for port in &config.expose {
        out.push("--expose".to_string());
        out.push(port.to_string());
    }
    for mount in &config.mounts {
        let source = match &mount.source {
            MountSource::Volume(name) => name.clone(),
            MountSource::Bind(path) => path.display().to_string(),
        };
        let mut spec = format!("{}:{}", source, mount.target);
        if mount.read_only {
            spec.push_str(":ro");
        }
        out.push("--volume".to_string());
        out.push(spec);
    }
    // further networks are connected after create
    if let Some(first) = config.networks.first() {
        out.extend(args(&["--network", &first.network]));
        for alias in &first.aliases {
            out.extend(args(&["--network-alias", alias]));
        }
    }
    for (key, value) in &config.labels {
        out.push("--label".to_string());
        out.push(format!("{}={}", key, value));
    }

    let mut entrypoint = config.entrypoint.iter();
    if let Some(program) = entrypoint.next() {
        out.extend(args(&["--entrypoint", program]));
    }

    out.push(config.image.clone());
    out.extend(entrypoint.cloned());
    out.extend(config.cmd.iter().cloned());
    out
}

/// Arguments for `docker build`
pub fn build_args(image: &str, build: &BuildSpec) -> Vec<String> {
    let mut out = args(&["build", "--tag", image]);
    if let Some(dockerfile) = &build.dockerfile {
        out.push("--file".to_string());
        out.push(build.context.join(dockerfile).display().to_string());
    }
    if let Some(target) = &build.target {
        out.extend(args(&["--target", target]));
    }
    for (key, value) in &build.args {
        out.push("--build-arg".to_string());
        out.push(format!("{}={}", key, value));
    }
    out.push(build.context.display().to_string());
    out
}

/// Parse the comma-separated `Labels` column of `docker ps`/`volume ls`
pub fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    state: String,
    #[serde(default)]
    labels: String,
    #[serde(default)]
    ports: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VolumeLine {
    name: String,
    driver: String,
    #[serde(default)]
    mountpoint: String,
    #[serde(default)]
    labels: String,
}

/// Host ports from the `Ports` column of `docker ps`
///
/// The column reads like `0.0.0.0:8080->80/tcp, :::8080->80/tcp` or
/// `0.0.0.0:8000-8001->8000-8001/tcp`; exposed-only ports have no `->`.
pub fn parse_published(ports: &str) -> Vec<u16> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r":(\d+)(?:-(\d+))?->").expect("pattern is valid"));

    let mut published = Vec::new();
    for caps in re.captures_iter(ports) {
        let Some(start) = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok()) else {
            continue;
        };
        let end = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .unwrap_or(start);
        for port in start..=end {
            if !published.contains(&port) {
                published.push(port);
            }
        }
    }
    published
}

fn json_lines<T: for<'de> Deserialize<'de>>(stdout: &str) -> Result<Vec<T>> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(StevedoreError::from))
        .collect()
}

#[async_trait]
impl Engine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ensure_network(&self, request: &NetworkRequest) -> Result<bool> {
        if self.network_exists(&request.name).await? {
            return Ok(false);
        }

        let mut cmd = args(&["network", "create"]);
        if let Some(driver) = &request.driver {
            cmd.extend(args(&["--driver", driver]));
        }
        if request.internal {
            cmd.push("--internal".to_string());
        }
        for (key, value) in &request.labels {
            cmd.push("--label".to_string());
            cmd.push(format!("{}={}", key, value));
        }
        cmd.push(request.name.clone());

        self.run(&cmd).await?;
        Ok(true)
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        self.succeeds(&args(&["network", "inspect", name])).await
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        match self.run(&args(&["network", "rm", name])).await {
            Err(e) if is_missing(&e) => Ok(()),
            other => other.map(drop),
        }
    }

    async fn ensure_volume(&self, request: &VolumeRequest) -> Result<bool> {
        if self.volume_exists(&request.name).await? {
            return Ok(false);
        }

        let mut cmd = args(&["volume", "create"]);
        if let Some(driver) = &request.driver {
            cmd.extend(args(&["--driver", driver]));
        }
        for (key, value) in &request.driver_opts {
            cmd.push("--opt".to_string());
            cmd.push(format!("{}={}", key, value));
        }
        for (key, value) in &request.labels {
            cmd.push("--label".to_string());
            cmd.push(format!("{}={}", key, value));
        }
        cmd.push(request.name.clone());

        self.run(&cmd)
            .await
            .map_err(|e| StevedoreError::VolumeMount {
                volume: request.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(true)
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        self.succeeds(&args(&["volume", "inspect", name])).await
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        match self.run(&args(&["volume", "rm", name])).await {
            Err(e) if is_missing(&e) => Err(StevedoreError::VolumeNotFound(name.to_string())),
            other => other.map(drop),
        }
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        let stdout = self
            .run(&args(&["volume", "ls", "--format", "{{json .}}"]))
            .await?;

        Ok(json_lines::<VolumeLine>(&stdout)?
            .into_iter()
            .map(|v| VolumeSummary {
                name: v.name,
                driver: v.driver,
                mountpoint: (!v.mountpoint.is_empty()).then(|| PathBuf::from(v.mountpoint)),
                labels: parse_labels(&v.labels),
                size: None,
            })
            .collect())
    }

    async fn list_containers(&self, project: &str) -> Result<Vec<ContainerSummary>> {
        let filter = format!("label={}={}", LABEL_PROJECT, project);
        let stdout = self
            .run(&args(&["ps", "--all", "--filter", &filter, "--format", "{{json .}}"]))
            .await?;

        let mut containers: Vec<ContainerSummary> = json_lines::<PsLine>(&stdout)?
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id,
                name: c.names,
                status: ContainerStatus::from_state(&c.state),
                labels: parse_labels(&c.labels),
                published: parse_published(&c.ports),
            })
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(containers)
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        let id = self.run(&create_args(config)).await?;

        for attachment in config.networks.iter().skip(1) {
            let mut cmd = args(&["network", "connect"]);
            for alias in &attachment.aliases {
                cmd.extend(args(&["--alias", alias]));
            }
            cmd.push(attachment.network.clone());
            cmd.push(id.clone());
            self.run(&cmd).await?;
        }

        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.run(&args(&["start", id])).await.map(drop)
    }

    async fn stop_container(&self, id: &str, timeout: Option<u64>) -> Result<()> {
        let mut cmd = args(&["stop"]);
        if let Some(secs) = timeout {
            cmd.push("--time".to_string());
            cmd.push(secs.to_string());
        }
        cmd.push(id.to_string());
        self.run(&cmd).await.map(drop)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        match self.run(&args(&["rm", "--force", id])).await {
            Err(e) if is_missing(&e) => Err(StevedoreError::ContainerNotFound(id.to_string())),
            other => other.map(drop),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.succeeds(&args(&["image", "inspect", image])).await
    }

    async fn build_image(&self, image: &str, build: &BuildSpec) -> Result<()> {
        tracing::info!("Building {} from {}", image, build.context.display());
        self.run(&build_args(image, build)).await.map(drop)
    }
}

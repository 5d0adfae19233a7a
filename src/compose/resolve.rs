//! Composition resolver
//!
//! Turns a parsed descriptor into a [`ResolvedProject`]: concrete service
//! specs with parsed ports and mounts, project-scoped volume and network
//! names, and per-service environments. Nothing in a resolved project
//! contains a placeholder.

use super::config::{
    BuildConfig, CommandConfig, ComposeConfig, EnvironmentConfig, NetworkConfig, NetworksConfig,
    PortConfig, PortConfigLong, ServiceConfig, VolumeConfig, VolumeMount as MountConfig,
    VolumeMountLong,
};
use super::env::Environment;
use super::interpolate::referenced_variables;
use super::parser::{ComposeParser, ParsedCompose};
use crate::container::{MountSource, PortMapping, VolumeMount};
use crate::error::{Result, StevedoreError};
use crate::network::port::{parse_expose, parse_port, parse_port_spec, parse_protocol};
use crate::settings::ProjectSettings;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Network every service joins unless it lists its own
pub const DEFAULT_NETWORK: &str = "default";

/// A fully resolved project
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedProject {
    /// Normalized project name
    pub name: String,
    /// Directory relative paths were resolved against
    pub working_dir: PathBuf,
    pub services: BTreeMap<String, ServiceSpec>,
    pub networks: BTreeMap<String, NetworkSpec>,
    pub volumes: BTreeMap<String, VolumeSpec>,
    /// Non-fatal findings collected while loading
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl ResolvedProject {
    /// Look up a service
    pub fn service(&self, name: &str) -> Result<&ServiceSpec> {
        self.services
            .get(name)
            .ok_or_else(|| StevedoreError::ServiceNotFound(name.to_string()))
    }

    /// Look up a volume by its descriptor key
    pub fn volume(&self, key: &str) -> Result<&VolumeSpec> {
        self.volumes
            .get(key)
            .ok_or_else(|| StevedoreError::VolumeNotFound(key.to_string()))
    }

    /// Look up a network by its descriptor key
    pub fn network(&self, key: &str) -> Result<&NetworkSpec> {
        self.networks
            .get(key)
            .ok_or_else(|| StevedoreError::NetworkNotFound(key.to_string()))
    }

    /// Every published port with the service that publishes it
    pub fn published_ports(&self) -> impl Iterator<Item = (&str, &PortMapping)> {
        self.services.values().flat_map(|service| {
            service
                .ports
                .iter()
                .filter(|p| p.host_port.is_some())
                .map(move |p| (service.name.as_str(), p))
        })
    }
}

/// How a service image is built
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildSpec {
    /// Absolute build context
    pub context: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A resolved service definition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Image to run; also the tag for `build` services
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<u16>,
    /// Mounts; named volume sources use descriptor keys
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<VolumeMount>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Network key -> extra aliases
    pub networks: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

impl ServiceSpec {
    /// Descriptor keys of the named volumes this service mounts
    pub fn volume_keys(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().filter_map(|m| match &m.source {
            MountSource::Volume(key) => Some(key.as_str()),
            MountSource::Bind(_) => None,
        })
    }
}

/// A resolved named volume
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeSpec {
    /// Key in the descriptor
    pub key: String,
    /// Name as known to the engine
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub driver_opts: BTreeMap<String, String>,
    pub external: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A resolved network
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSpec {
    /// Key in the descriptor
    pub key: String,
    /// Name as known to the engine
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    pub internal: bool,
    pub external: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Load, interpolate, validate and resolve a project
pub fn load_project(settings: &ProjectSettings) -> Result<ResolvedProject> {
    let env = settings.environment()?;
    let files = settings.compose_files()?;
    let parsed = ComposeParser::parse_files(&files, &env)?;

    Resolver::new(&env, &settings.project_dir)
        .project_name(settings.project_name.clone())
        .resolve(parsed)
}

/// Variables the project's compose files reference, each with whether the
/// environment defines it
pub fn project_variables(settings: &ProjectSettings) -> Result<BTreeMap<String, bool>> {
    let env = settings.environment()?;
    let merged = ComposeParser::load_files(&settings.compose_files()?)?;

    Ok(referenced_variables(&merged)
        .into_iter()
        .map(|name| {
            let defined = env.contains(&name);
            (name, defined)
        })
        .collect())
}

/// Resolves parsed descriptors against an environment and a working directory
pub struct Resolver<'a> {
    env: &'a Environment,
    working_dir: PathBuf,
    project_name: Option<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(env: &'a Environment, working_dir: &Path) -> Self {
        Self {
            env,
            working_dir: working_dir.to_path_buf(),
            project_name: None,
        }
    }

    /// Override the project name
    pub fn project_name(mut self, name: Option<String>) -> Self {
        self.project_name = name;
        self
    }

    /// Resolve a parsed descriptor
    pub fn resolve(&self, parsed: ParsedCompose) -> Result<ResolvedProject> {
        let ParsedCompose {
            config,
            mut warnings,
        } = parsed;

        warnings.extend(ComposeParser::validate(&config)?);

        let name = self.resolve_project_name(&config)?;

        let volumes: BTreeMap<String, VolumeSpec> = config
            .volumes
            .iter()
            .map(|(key, cfg)| (key.clone(), resolve_volume(&name, key, cfg.as_ref())))
            .collect();

        let mut networks: BTreeMap<String, NetworkSpec> = config
            .networks
            .iter()
            .map(|(key, cfg)| (key.clone(), resolve_network(&name, key, cfg.as_ref())))
            .collect();

        let mut services = BTreeMap::new();
        for (service_name, service) in &config.services {
            let spec = self.resolve_service(&name, service_name, service, &volumes)?;
            services.insert(service_name.clone(), spec);
        }

        let uses_default = services
            .values()
            .any(|s: &ServiceSpec| s.networks.contains_key(DEFAULT_NETWORK));
        if uses_default && !networks.contains_key(DEFAULT_NETWORK) {
            networks.insert(
                DEFAULT_NETWORK.to_string(),
                resolve_network(&name, DEFAULT_NETWORK, None),
            );
        }

        Ok(ResolvedProject {
            name,
            working_dir: self.working_dir.clone(),
            services,
            networks,
            volumes,
            warnings,
        })
    }

    fn resolve_project_name(&self, config: &ComposeConfig) -> Result<String> {
        let raw = self
            .project_name
            .clone()
            .or_else(|| {
                self.env
                    .get("COMPOSE_PROJECT_NAME")
                    .filter(|v| !v.is_empty())
                    .map(String::from)
            })
            .or_else(|| config.name.clone())
            .or_else(|| {
                self.working_dir
                    .file_name()
                    .and_then(|s| s.to_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| "default".to_string());

        normalize_project_name(&raw)
    }

    fn resolve_service(
        &self,
        project: &str,
        name: &str,
        service: &ServiceConfig,
        volumes: &BTreeMap<String, VolumeSpec>,
    ) -> Result<ServiceSpec> {
        let image = service
            .image
            .clone()
            .unwrap_or_else(|| format!("{}-{}", project, name));

        let build = service.build.as_ref().map(|b| self.resolve_build(b));

        let command = match &service.command {
            Some(cmd) => command_words(cmd)?,
            None => Vec::new(),
        };
        let entrypoint = match &service.entrypoint {
            Some(cmd) => command_words(cmd)?,
            None => Vec::new(),
        };

        let environment = self.resolve_environment(service)?;

        let mut ports = Vec::new();
        for port in service.ports.iter().flatten() {
            match port {
                PortConfig::Short(spec) => ports.extend(parse_port_spec(&spec.to_string())?),
                PortConfig::Long(long) => ports.push(resolve_long_port(long)?),
            }
        }

        let mut expose = Vec::new();
        for entry in service.expose.iter().flatten() {
            expose.extend(parse_expose(&entry.to_string())?);
        }

        let mut mounts = Vec::new();
        for mount in service.volumes.iter().flatten() {
            mounts.push(self.resolve_mount(name, mount, volumes)?);
        }

        let depends_on = service
            .depends_on
            .as_ref()
            .map(|d| d.entries().into_iter().map(|(dep, _)| dep).collect())
            .unwrap_or_default();

        let networks = match &service.networks {
            None => BTreeMap::from([(DEFAULT_NETWORK.to_string(), Vec::new())]),
            Some(NetworksConfig::Array(names)) => {
                names.iter().map(|n| (n.clone(), Vec::new())).collect()
            }
            Some(NetworksConfig::Map(map)) => map
                .iter()
                .map(|(n, cfg)| {
                    let aliases = cfg
                        .as_ref()
                        .and_then(|c| c.aliases.clone())
                        .unwrap_or_default();
                    (n.clone(), aliases)
                })
                .collect(),
        };

        Ok(ServiceSpec {
            name: name.to_string(),
            image,
            build,
            command,
            entrypoint,
            environment,
            ports,
            expose,
            mounts,
            depends_on,
            networks,
            labels: service
                .labels
                .as_ref()
                .map(|l| l.to_map())
                .unwrap_or_default(),
            restart: service.restart.clone(),
            working_dir: service.working_dir.clone(),
            user: service.user.clone(),
            hostname: service.hostname.clone(),
            container_name: service.container_name.clone(),
        })
    }

    fn resolve_build(&self, build: &BuildConfig) -> BuildSpec {
        match build {
            BuildConfig::Simple(context) => BuildSpec {
                context: self.host_path(context),
                dockerfile: None,
                args: BTreeMap::new(),
                target: None,
            },
            BuildConfig::Full(full) => BuildSpec {
                context: self.host_path(full.context.as_deref().unwrap_or(".")),
                dockerfile: full.dockerfile.clone(),
                args: full
                    .args
                    .as_ref()
                    .map(|args| args.iter().map(|(k, v)| (k.clone(), v.to_string())).collect())
                    .unwrap_or_default(),
                target: full.target.clone(),
            },
        }
    }

    /// env_file entries first, explicit `environment` entries on top
    fn resolve_environment(&self, service: &ServiceConfig) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();

        if let Some(files) = &service.env_file {
            for path in files.paths() {
                let file_env = Environment::from_file(&self.host_path(path))?;
                for (key, value) in file_env.iter() {
                    env.insert(key.to_string(), value.to_string());
                }
            }
        }

        match &service.environment {
            Some(EnvironmentConfig::Map(map)) => {
                for (key, value) in map {
                    match value {
                        Some(v) => {
                            env.insert(key.clone(), v.to_string());
                        }
                        None => self.inherit(&mut env, key),
                    }
                }
            }
            Some(EnvironmentConfig::Array(items)) => {
                for item in items {
                    match item.split_once('=') {
                        Some((key, value)) => {
                            env.insert(key.to_string(), value.to_string());
                        }
                        None => self.inherit(&mut env, item),
                    }
                }
            }
            None => {}
        }

        Ok(env)
    }

    /// Bare `KEY` entries take their value from the environment set
    fn inherit(&self, env: &mut BTreeMap<String, String>, key: &str) {
        match self.env.get(key) {
            Some(value) => {
                env.insert(key.to_string(), value.to_string());
            }
            None => {
                env.remove(key);
            }
        }
    }

    fn resolve_mount(
        &self,
        service: &str,
        mount: &MountConfig,
        volumes: &BTreeMap<String, VolumeSpec>,
    ) -> Result<VolumeMount> {
        let (source, target, read_only) = match mount {
            MountConfig::Short(spec) => parse_short_mount(service, spec)?,
            MountConfig::Long(long) => long_mount_parts(service, long)?,
        };

        if !target.starts_with('/') {
            return Err(StevedoreError::Configuration(format!(
                "Service '{}' mounts at '{}', which is not an absolute container path",
                service, target
            )));
        }

        let source = match source {
            SourceKind::Bind(path) => MountSource::Bind(self.host_path(&path)),
            SourceKind::Volume(key) => {
                if !volumes.contains_key(&key) {
                    return Err(StevedoreError::Configuration(format!(
                        "Service '{}' refers to undefined volume '{}'",
                        service, key
                    )));
                }
                MountSource::Volume(key)
            }
        };

        Ok(VolumeMount {
            source,
            target,
            read_only,
        })
    }

    fn host_path(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        let path = path.strip_prefix("./").unwrap_or(path);
        if path == "." {
            return self.working_dir.clone();
        }
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.working_dir.join(candidate)
        }
    }
}

enum SourceKind {
    Volume(String),
    Bind(String),
}

fn is_path_like(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

fn parse_short_mount(service: &str, spec: &str) -> Result<(SourceKind, String, bool)> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [_] => {
            return Err(StevedoreError::Configuration(format!(
                "Service '{}' declares anonymous volume '{}'; name it under top-level 'volumes'",
                service, spec
            )))
        }
        [source, target] => (*source, *target, None),
        [source, target, mode] => (*source, *target, Some(*mode)),
        _ => {
            return Err(StevedoreError::Configuration(format!(
                "Service '{}' has invalid volume spec '{}'",
                service, spec
            )))
        }
    };

    let mut read_only = false;
    for flag in mode.into_iter().flat_map(|m| m.split(',')) {
        match flag {
            "ro" => read_only = true,
            "rw" => read_only = false,
            "z" | "Z" | "cached" | "delegated" | "consistent" | "nocopy" => {}
            other => {
                return Err(StevedoreError::Configuration(format!(
                    "Service '{}' has unknown volume mode '{}' in '{}'",
                    service, other, spec
                )))
            }
        }
    }

    let kind = if is_path_like(source) {
        SourceKind::Bind(source.to_string())
    } else {
        SourceKind::Volume(source.to_string())
    };

    Ok((kind, target.to_string(), read_only))
}

fn long_mount_parts(service: &str, long: &VolumeMountLong) -> Result<(SourceKind, String, bool)> {
    let source = long.source.clone().ok_or_else(|| {
        StevedoreError::Configuration(format!(
            "Service '{}' mounts '{}' without a source; anonymous volumes are not supported",
            service, long.target
        ))
    })?;

    let mount_type = long.mount_type.as_deref().unwrap_or(if is_path_like(&source) {
        "bind"
    } else {
        "volume"
    });

    let kind = match mount_type {
        "volume" => SourceKind::Volume(source),
        "bind" => SourceKind::Bind(source),
        other => {
            return Err(StevedoreError::Configuration(format!(
                "Service '{}' uses mount type '{}', which is not supported",
                service, other
            )))
        }
    };

    Ok((kind, long.target.clone(), long.read_only.unwrap_or(false)))
}

fn resolve_long_port(long: &PortConfigLong) -> Result<PortMapping> {
    let invalid = |reason: String| {
        StevedoreError::Configuration(format!("Invalid port entry: {}", reason))
    };

    let container_port = parse_port(&long.target.to_string()).map_err(invalid)?;
    let host_port = match &long.published {
        Some(p) => Some(parse_port(&p.to_string()).map_err(invalid)?),
        None => None,
    };
    let protocol = parse_protocol(long.protocol.as_deref()).map_err(invalid)?;

    Ok(PortMapping {
        host_ip: long.host_ip.clone(),
        host_port,
        container_port,
        protocol,
    })
}

fn resolve_volume(project: &str, key: &str, cfg: Option<&VolumeConfig>) -> VolumeSpec {
    let cfg = cfg.cloned().unwrap_or_default();
    let external = cfg.external.as_ref().is_some_and(|e| e.is_external());
    let name = cfg
        .name
        .clone()
        .or_else(|| cfg.external.as_ref().and_then(|e| e.name().map(String::from)))
        .unwrap_or_else(|| scoped_name(project, key, external));

    VolumeSpec {
        key: key.to_string(),
        name,
        driver: cfg.driver,
        driver_opts: cfg.driver_opts.unwrap_or_default(),
        external,
        labels: cfg.labels.map(|l| l.to_map()).unwrap_or_default(),
    }
}

fn resolve_network(project: &str, key: &str, cfg: Option<&NetworkConfig>) -> NetworkSpec {
    let cfg = cfg.cloned().unwrap_or_default();
    let external = cfg.external.as_ref().is_some_and(|e| e.is_external());
    let name = cfg
        .name
        .clone()
        .or_else(|| cfg.external.as_ref().and_then(|e| e.name().map(String::from)))
        .unwrap_or_else(|| scoped_name(project, key, external));

    NetworkSpec {
        key: key.to_string(),
        name,
        driver: cfg.driver,
        internal: cfg.internal.unwrap_or(false),
        external,
        labels: cfg.labels.map(|l| l.to_map()).unwrap_or_default(),
    }
}

fn scoped_name(project: &str, key: &str, external: bool) -> String {
    if external {
        key.to_string()
    } else {
        format!("{}_{}", project, key)
    }
}

/// Lowercase and strip characters engines reject in resource names
pub fn normalize_project_name(raw: &str) -> Result<String> {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-z0-9_-]").expect("pattern is valid"));

    let lowered = raw.to_lowercase();
    let name = invalid.replace_all(&lowered, "").into_owned();

    match name.chars().next() {
        Some(c) if c.is_ascii_alphanumeric() => Ok(name),
        _ => Err(StevedoreError::Configuration(format!(
            "Project name '{}' must contain a letter or digit first and only [a-z0-9_-]",
            raw
        ))),
    }
}

fn command_words(cmd: &CommandConfig) -> Result<Vec<String>> {
    match cmd {
        CommandConfig::Shell(line) => split_command(line),
        CommandConfig::Exec(words) => Ok(words.clone()),
    }
}

/// Split a command line into words the way a POSIX shell would, without expansion
pub fn split_command(line: &str) -> Result<Vec<String>> {
    let unterminated = || {
        StevedoreError::Configuration(format!("Unterminated quote in command '{}'", line))
    };

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(unterminated()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }

    Ok(words)
}

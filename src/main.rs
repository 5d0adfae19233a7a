//! Stevedore - environment-driven service composition
//!
//! This is the main CLI entry point for Stevedore.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use stevedore::compose::{load_project, project_variables, ComposeOrchestrator, UpOptions};
use stevedore::engine::{self, Engine};
use stevedore::settings::{EngineKind, EngineSettings, ProjectSettings};
use stevedore::StevedoreError;
use tracing_subscriber::EnvFilter;

/// Stevedore - environment-driven service composition
#[derive(Parser)]
#[command(name = "stevedore")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Bring up Compose-style projects with environment-resolved configuration", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Compose file (repeatable; later files override earlier ones)
    #[arg(short = 'f', long = "file", global = true, env = "COMPOSE_FILE", value_delimiter = ':')]
    files: Vec<PathBuf>,

    /// Project name
    #[arg(short = 'p', long, global = true, env = "COMPOSE_PROJECT_NAME")]
    project_name: Option<String>,

    /// Directory relative paths resolve against (default: the first file's directory)
    #[arg(long, global = true)]
    project_directory: Option<PathBuf>,

    /// Env file used for placeholder substitution (repeatable)
    #[arg(long = "env-file", global = true)]
    env_files: Vec<PathBuf>,

    /// Engine to drive (docker or local)
    #[arg(long, global = true, env = "STEVEDORE_ENGINE", default_value = "docker")]
    engine: EngineKind,

    /// State directory for the local engine
    #[arg(long, global = true, env = "STEVEDORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start services
    Up {
        /// Build images before starting
        #[arg(long)]
        build: bool,
        /// Skip probing published host ports
        #[arg(long)]
        no_port_check: bool,
        /// Services to start (with their dependencies)
        services: Vec<String>,
    },
    /// Stop and remove containers and networks
    Down {
        /// Remove named volumes too
        #[arg(short, long)]
        volumes: bool,
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Start existing containers
    Start {
        services: Vec<String>,
    },
    /// Stop running containers
    Stop {
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        services: Vec<String>,
    },
    /// Restart containers
    Restart {
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        services: Vec<String>,
    },
    /// List project containers
    Ps,
    /// Print the resolved project
    Config {
        /// Print service names in start order
        #[arg(long, conflicts_with_all = ["volumes", "variables"])]
        services: bool,
        /// Print volume names
        #[arg(long, conflicts_with = "variables")]
        volumes: bool,
        /// Print referenced variables and whether each is set
        #[arg(long)]
        variables: bool,
    },
    /// Manage volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// List volumes
    Ls,
    /// Remove volumes
    Rm {
        /// Volume names
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let code = err
                .downcast_ref::<StevedoreError>()
                .map(StevedoreError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let engine_settings = EngineSettings::new(cli.engine, cli.data_dir.clone());

    // volume commands need no project
    if let Commands::Volume { command } = &cli.command {
        let engine = engine::connect(&engine_settings)?;
        return volume_command(engine.as_ref(), command).await;
    }

    let settings = project_settings(&cli, &cwd);

    // works even when variables are missing
    if let Commands::Config { variables: true, .. } = &cli.command {
        println!("{:<24} {}", "VARIABLE", "STATUS");
        for (name, defined) in project_variables(&settings)? {
            println!("{:<24} {}", name, if defined { "set" } else { "unset" });
        }
        return Ok(());
    }

    let project = load_project(&settings)?;
    for warning in &project.warnings {
        tracing::warn!("{}", warning);
    }

    if let Commands::Config { services, volumes, .. } = &cli.command {
        if *services {
            for name in stevedore::compose::order::start_order(&project)? {
                println!("{}", name);
            }
        } else if *volumes {
            for key in project.volumes.keys() {
                println!("{}", key);
            }
        } else {
            print!("{}", serde_yaml::to_string(&project)?);
        }
        return Ok(());
    }

    let engine = engine::connect(&engine_settings)?;
    let orchestrator = ComposeOrchestrator::new(project, engine);

    match cli.command {
        Commands::Up {
            build,
            no_port_check,
            services,
        } => {
            let options = UpOptions {
                build,
                check_ports: !no_port_check,
                services,
            };
            let report = orchestrator.up(&options).await?;

            for network in &report.networks_created {
                println!("Network {} created", network);
            }
            for volume in &report.volumes_created {
                println!("Volume {} created", volume);
            }
            for (service, action) in &report.services {
                println!("Service {} {}", service, action);
            }
        }
        Commands::Down { volumes, timeout } => {
            let report = orchestrator.down(volumes, timeout).await?;

            for container in &report.containers_removed {
                println!("Container {} removed", container);
            }
            for network in &report.networks_removed {
                println!("Network {} removed", network);
            }
            for volume in &report.volumes_removed {
                println!("Volume {} removed", volume);
            }
        }
        Commands::Start { services } => {
            for service in orchestrator.start(&services).await? {
                println!("Service {} started", service);
            }
        }
        Commands::Stop { timeout, services } => {
            for service in orchestrator.stop(&services, timeout).await? {
                println!("Service {} stopped", service);
            }
        }
        Commands::Restart { timeout, services } => {
            for service in orchestrator.restart(&services, timeout).await? {
                println!("Service {} restarted", service);
            }
        }
        Commands::Ps => {
            println!("{:<32} {:<16} {:<12}", "NAME", "SERVICE", "STATUS");
            for container in orchestrator.ps().await? {
                println!(
                    "{:<32} {:<16} {:<12}",
                    container.name,
                    container.service().unwrap_or("-"),
                    container.status
                );
            }
        }
        Commands::Config { .. } | Commands::Volume { .. } => {}
    }

    Ok(())
}

async fn volume_command(engine: &dyn Engine, command: &VolumeCommands) -> anyhow::Result<()> {
    match command {
        VolumeCommands::Ls => {
            println!("{:<10} {:<10} {}", "DRIVER", "SIZE", "VOLUME NAME");
            for volume in engine.list_volumes().await? {
                let size = volume
                    .size
                    .map_or_else(|| "-".to_string(), |bytes| bytes.to_string());
                println!("{:<10} {:<10} {}", volume.driver, size, volume.name);
            }
        }
        VolumeCommands::Rm { names } => {
            for name in names {
                engine.remove_volume(name).await?;
                println!("{}", name);
            }
        }
    }
    Ok(())
}

/// Project settings from the command line; paths given on it are relative to `cwd`
fn project_settings(cli: &Cli, cwd: &Path) -> ProjectSettings {
    let absolute = |p: &PathBuf| if p.is_absolute() { p.clone() } else { cwd.join(p) };

    let files: Vec<PathBuf> = cli.files.iter().map(absolute).collect();
    let project_dir = cli
        .project_directory
        .as_ref()
        .map(absolute)
        .or_else(|| files.first().and_then(|f| f.parent()).map(Path::to_path_buf))
        .unwrap_or_else(|| cwd.to_path_buf());

    let mut settings = ProjectSettings::new(project_dir);
    settings.compose_files = files;
    settings.env_files = cli.env_files.iter().map(absolute).collect();
    settings.project_name = cli.project_name.clone();
    settings
}

//! Docker Compose compatible orchestration
//!
//! Loading a project is parse -> interpolate -> validate -> resolve; the
//! orchestrator then brings the resolved project up through an engine.

pub mod config;
pub mod env;
pub mod interpolate;
pub mod orchestrator;
pub mod order;
pub mod parser;
pub mod resolve;

pub use config::{ComposeConfig, ServiceConfig};
pub use env::Environment;
pub use orchestrator::{ComposeOrchestrator, DownReport, ServiceAction, UpOptions, UpReport};
pub use parser::ComposeParser;
pub use resolve::{load_project, project_variables, ResolvedProject, Resolver, ServiceSpec};

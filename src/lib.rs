//! Stevedore - environment-driven service composition
//!
//! Stevedore reads a Compose-style descriptor, resolves its `${VAR}`
//! placeholders against an environment, and brings the services up in
//! dependency order through a container engine. It provides:
//!
//! - Placeholder substitution with all-at-once reporting of missing variables
//! - Deterministic dependency ordering
//! - Idempotent creation of networks, named volumes and containers
//! - Host port preflight before anything starts
//! - A `docker` CLI engine and a state-only local engine

pub mod compose;
pub mod container;
pub mod engine;
pub mod error;
pub mod network;
pub mod settings;
pub mod storage;

pub use error::{Result, StevedoreError};

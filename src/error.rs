//! Error types for Stevedore

use thiserror::Error;

/// Result type for Stevedore operations
pub type Result<T> = std::result::Result<T, StevedoreError>;

/// Stevedore error types
#[derive(Error, Debug)]
pub enum StevedoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration error: required variable(s) not set: {}", .0.join(", "))]
    UndefinedVariables(Vec<String>),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Port conflict for service '{service}' on host port {port}: {reason}")]
    PortConflict {
        service: String,
        port: u16,
        reason: String,
    },

    #[error("Cannot mount volume '{volume}': {reason}")]
    VolumeMount { volume: String, reason: String },

    #[error("Service '{service}' failed to start: {reason}")]
    ServiceStart { service: String, reason: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StevedoreError {
    /// Whether this error belongs to the configuration class
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StevedoreError::Configuration(_)
                | StevedoreError::UndefinedVariables(_)
                | StevedoreError::ComposeParse(_)
                | StevedoreError::Yaml(_)
        )
    }

    /// Process exit code for this error (sysexits.h values)
    pub fn exit_code(&self) -> i32 {
        match self {
            e if e.is_configuration() => 78,
            StevedoreError::PortConflict { .. } => 69,
            StevedoreError::VolumeMount { .. } => 73,
            StevedoreError::ServiceStart { .. } => 70,
            _ => 1,
        }
    }
}

//! Container records and their state transitions

use super::config::{ContainerConfig, ContainerStatus};
use crate::error::{Result, StevedoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Container instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Container ID
    pub id: String,
    /// Configuration the container was created from
    pub config: ContainerConfig,
    /// Current state
    pub status: ContainerStatus,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last start
    pub started_at: Option<DateTime<Utc>>,
    /// Last stop
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code of the last run
    pub exit_code: Option<i32>,
}

impl Container {
    /// Create a new container in the `created` state
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            config,
            status: ContainerStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
        }
    }

    /// Get container name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Check if container is running
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Start the container; starting a running container is a no-op
    pub fn start(&mut self) -> Result<()> {
        match self.status {
            ContainerStatus::Running => Ok(()),
            ContainerStatus::Removing | ContainerStatus::Dead => Err(StevedoreError::Engine(
                format!("Container {} is {} and cannot be started", self.name(), self.status),
            )),
            _ => {
                self.status = ContainerStatus::Running;
                self.started_at = Some(Utc::now());
                self.exit_code = None;
                Ok(())
            }
        }
    }

    /// Stop the container; stopping a stopped container is a no-op
    pub fn stop(&mut self) {
        if matches!(
            self.status,
            ContainerStatus::Running | ContainerStatus::Paused | ContainerStatus::Restarting
        ) {
            self.status = ContainerStatus::Exited;
            self.finished_at = Some(Utc::now());
            self.exit_code = Some(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut container = Container::new(ContainerConfig::new("quickdish-db-1", "postgres:16"));
        assert_eq!(container.status, ContainerStatus::Created);
        assert_eq!(container.id.len(), 32);

        container.start().unwrap();
        assert!(container.is_running());
        let started = container.started_at;
        container.start().unwrap();
        assert_eq!(container.started_at, started);

        container.stop();
        assert_eq!(container.status, ContainerStatus::Exited);
        assert_eq!(container.exit_code, Some(0));

        container.start().unwrap();
        assert!(container.is_running());
        assert_eq!(container.exit_code, None);
    }

    #[test]
    fn test_dead_container_cannot_start() {
        let mut container = Container::new(ContainerConfig::new("x", "y"));
        container.status = ContainerStatus::Dead;
        assert!(container.start().is_err());
    }
}

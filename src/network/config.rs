//! Network records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

const DEFAULT_DRIVER: &str = "bridge";

/// A project network as recorded by the local engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// Network ID
    pub id: String,
    /// Network name
    pub name: String,
    /// Network driver
    pub driver: String,
    /// Internal network (no external access)
    pub internal: bool,
    /// Network labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Connected containers by name
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
    /// Created timestamp
    pub created: DateTime<Utc>,
}

impl Network {
    /// Create a new network record
    pub fn new(name: &str) -> Self {
        Self {
            id: short_id(),
            name: name.to_string(),
            driver: DEFAULT_DRIVER.to_string(),
            internal: false,
            labels: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            created: Utc::now(),
        }
    }

    /// Set driver
    pub fn driver(mut self, driver: &str) -> Self {
        self.driver = driver.to_string();
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Set internal flag
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Container that answers to `alias` on this network, if any
    pub fn resolve(&self, alias: &str) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|(name, ep)| name.as_str() == alias || ep.aliases.iter().any(|a| a == alias))
            .map(|(name, _)| name.as_str())
    }
}

/// A container's membership in a network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// DNS names the container answers to on this network
    pub aliases: Vec<String>,
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_alias() {
        let mut network = Network::new("quickdish_default");
        network.endpoints.insert(
            "quickdish-db-1".to_string(),
            Endpoint {
                aliases: vec!["db".to_string()],
            },
        );

        assert_eq!(network.resolve("db"), Some("quickdish-db-1"));
        assert_eq!(network.resolve("quickdish-db-1"), Some("quickdish-db-1"));
        assert_eq!(network.resolve("api"), None);
        assert_eq!(network.id.len(), 12);
        assert_eq!(network.driver, "bridge");
    }
}

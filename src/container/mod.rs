//! Container management module
//!
//! Container configuration as handed to an engine, and the persisted
//! container records the local engine keeps.

pub mod config;
pub mod lifecycle;
pub mod runtime;

pub use config::{
    ContainerConfig, ContainerStatus, MountSource, NetworkAttachment, PortMapping, Protocol,
    VolumeMount,
};
pub use lifecycle::ContainerManager;
pub use runtime::Container;

//! Storage management module
//!
//! Named volumes, bind mount sources, and the JSON index files the local
//! engine keeps its state in.

pub mod index;
pub mod volume;

pub use volume::{ensure_host_dir, Volume, VolumeManager};

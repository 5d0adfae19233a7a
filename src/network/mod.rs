//! Network management module
//!
//! Project networks for the local engine, plus port specs and the host
//! port preflight shared by every engine.

pub mod config;
pub mod manager;
pub mod port;

pub use config::{Endpoint, Network};
pub use manager::NetworkManager;

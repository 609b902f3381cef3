//! Configuration for the cloud console.
//!
//! The configuration is a single YAML document describing the datacenters an
//! operator can log into, how many workers the dispatch layer runs, and how
//! VM creation is throttled and polled.

pub mod config;
pub mod loader;

pub use config::{ConsoleConfig, CreationSettings, DispatchSettings, JobPollSettings};
pub use console_logging::LogSettings;
pub use loader::ConfigLoader;

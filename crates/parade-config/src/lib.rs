//! Configuration for parade peers.
//!
//! Settings persist to disk as `config.ron`. CLI arguments override the file,
//! unknown fields are ignored and missing sections take their defaults.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig, SessionConfig};
pub use error::ConfigError;

//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Join a military parade collaboration session.
///
/// Values given here override `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "parade-peer", about = "Collaborative military parade session peer")]
pub struct CliArgs {
    /// Name announced to other peers.
    #[arg(long)]
    pub name: Option<String>,

    /// Address to listen on while hosting.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Host to dial while browsing. Repeatable.
    #[arg(long = "seed")]
    pub seeds: Vec<SocketAddr>,

    /// Host only; do not browse.
    #[arg(long, conflicts_with = "browse_only")]
    pub host_only: bool,

    /// Browse only; do not host.
    #[arg(long)]
    pub browse_only: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref name) = args.name {
            self.session.display_name = Some(name.clone());
        }
        if let Some(listen) = args.listen {
            self.network.listen_addr = listen;
        }
        if !args.seeds.is_empty() {
            self.network.seeds = args.seeds.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

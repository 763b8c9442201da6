//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Companion client command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "companion", about = "Companion protocol client")]
pub struct CliArgs {
    /// Server host.
    #[arg(long)]
    pub host: Option<String>,

    /// Companion port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Steam id that owns the player token.
    #[arg(long)]
    pub owner_id: Option<u64>,

    /// Player token.
    #[arg(long, allow_hyphen_values = true)]
    pub token: Option<i32>,

    /// Entity ids to subscribe to after connecting.
    #[arg(long = "entity")]
    pub entities: Vec<u32>,

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
        if let Some(ref host) = args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(owner_id) = args.owner_id {
            self.server.owner_id = Some(owner_id);
        }
        if let Some(token) = args.token {
            self.server.credential_token = Some(token);
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

//! Configuration for the companion client.
//!
//! Settings are loaded once at startup from a RON file, may be overridden from
//! the command line via clap, and are handed to the protocol engine as an
//! explicit value.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CommandConfig, Config, ConnectionConfig, DebugConfig, LimitsConfig, RequestConfig,
    ServerConfig, default_config_dir,
};
pub use error::ConfigError;

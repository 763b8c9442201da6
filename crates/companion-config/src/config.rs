//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Endpoint and credentials.
    pub server: ServerConfig,
    /// Local admission control.
    pub limits: LimitsConfig,
    /// Connection establishment and keepalive.
    pub connection: ConnectionConfig,
    /// Reply wait and resend cadence.
    pub requests: RequestConfig,
    /// Chat command forwarding. Disabled when `None`.
    pub commands: Option<CommandConfig>,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Endpoint and credential settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Companion port.
    pub port: u16,
    /// Steam id of the account the credential belongs to.
    pub owner_id: Option<u64>,
    /// Player token issued by the server on pairing.
    pub credential_token: Option<i32>,
}

/// Token bucket parameters applied per server identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bucket capacity (and initial fill).
    pub capacity: u32,
    /// Tokens added per refill tick.
    pub refill_amount: u32,
    /// Length of one refill tick in seconds.
    pub refill_interval_secs: f64,
    /// Fail with an admission error instead of waiting for tokens.
    pub raise_on_limit: bool,
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Retries after the first failed attempt. `None` retries forever.
    pub retries: Option<u32>,
    /// Delay between connection attempts in seconds.
    pub retry_delay_secs: u64,
    /// Idle interval after which the heartbeat sends a wakeup request.
    pub keepalive_secs: u64,
    /// Connect to the fixed test endpoint. Endpoint switching is refused.
    pub use_test_server: bool,
}

/// Reply wait cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Short poll interval in milliseconds.
    pub short_poll_ms: u64,
    /// Short polls without a reply before the first resend.
    pub short_polls: u32,
    /// Long poll interval in milliseconds.
    pub long_poll_ms: u64,
    /// Long polls without a reply before the next resend.
    pub long_polls: u32,
    /// Give up with `ResponseNotReceived` after this many resends.
    pub max_resends: Option<u32>,
}

/// Chat command settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    /// Team chat messages starting with this prefix are treated as commands.
    pub prefix: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Directory for JSON log files in debug builds.
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 28082,
            owner_id: None,
            credential_token: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            capacity: 25,
            refill_amount: 3,
            refill_interval_secs: 1.0,
            raise_on_limit: false,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retries: None,
            retry_delay_secs: 20,
            keepalive_secs: 240,
            use_test_server: false,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            short_poll_ms: 100,
            short_polls: 10,
            long_poll_ms: 1000,
            long_polls: 5,
            max_resends: None,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            prefix: "!".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Platform config directory for the client (`<config_dir>/companion`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("companion"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("capacity: 25"));
        assert!(ron_str.contains("port: 28082"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.server.owner_id = Some(76561198000000000);
        config.commands = Some(CommandConfig::default());
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(server: (host: \"10.0.0.5\"))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.server.host, "10.0.0.5");
        assert_eq!(config.server.port, 28082);
        assert_eq!(config.limits, LimitsConfig::default());
        assert!(config.commands.is_none());
    }

    #[test]
    fn test_unknown_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_default_retry_policy_is_unbounded() {
        let config = Config::default();
        assert_eq!(config.connection.retries, None);
        assert_eq!(config.connection.retry_delay_secs, 20);
        assert_eq!(config.requests.max_resends, None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.host = "203.0.113.7".to_string();
        config.server.credential_token = Some(-1234);
        config.limits.raise_on_limit = true;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.limits.capacity = 50;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().limits.capacity, 50);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }
}

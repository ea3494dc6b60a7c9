//! Configuration management for the overlay messenger.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "messenger.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "MESSENGER";

/// Complete configuration for the messenger node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Local identity presentation
    pub identity: IdentityConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Intervals and timeouts
    pub timing: TimingConfig,
}

/// Network and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to bind the message socket and DHT listener to
    pub listen_address: IpAddr,
    /// Port for both the UDP message socket and the TCP DHT listener
    pub listen_port: u16,
    /// Rendezvous server base URIs
    pub rendezvous_servers: Vec<String>,
    /// DHT nodes (multiaddrs with a `/p2p/` suffix) used for a cold start
    pub dht_bootstrap_nodes: Vec<String>,
    /// Enable the DHT engine
    pub enable_dht: bool,
    /// Enable UPnP port mapping
    pub enable_upnp: bool,
}

/// How this node presents itself to peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Display name sent in the sender header of outbound messages
    pub display_name: String,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the file store
    pub data_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

/// Intervals and timeouts of the background loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Pause between bootstrap synchronization cycles, in seconds
    pub sync_interval_secs: u64,
    /// Pause between consecutive rendezvous calls, in milliseconds
    pub step_delay_ms: u64,
    /// Interval between resends of an unacknowledged message, in milliseconds
    pub retry_interval_ms: u64,
    /// Upper bound on a single DHT lookup, in seconds
    pub dht_query_timeout_secs: u64,
    /// Upper bound on a single rendezvous HTTP call, in seconds
    pub http_timeout_secs: u64,
    /// Number of port mapping attempts
    pub nat_attempts: u32,
    /// Wait between port mapping attempts, in seconds
    pub nat_retry_wait_secs: u64,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            identity: IdentityConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::from([0, 0, 0, 0]),
            listen_port: crate::defaults::DEFAULT_PORT,
            rendezvous_servers: Vec::new(),
            dht_bootstrap_nodes: Vec::new(),
            enable_dht: true,
            enable_upnp: true,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("overlay-messenger"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: crate::defaults::DEFAULT_SYNC_INTERVAL_SECS,
            step_delay_ms: crate::defaults::DEFAULT_STEP_DELAY_MS,
            retry_interval_ms: crate::defaults::DEFAULT_RETRY_INTERVAL_MS,
            dht_query_timeout_secs: 30,
            http_timeout_secs: 10,
            nat_attempts: crate::defaults::DEFAULT_NAT_ATTEMPTS,
            nat_retry_wait_secs: 5,
        }
    }
}

impl TimingConfig {
    /// Pause between synchronization cycles
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Pause between consecutive rendezvous calls
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    /// Interval between resends
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Upper bound on a DHT lookup
    pub fn dht_query_timeout(&self) -> Duration {
        Duration::from_secs(self.dht_query_timeout_secs)
    }

    /// Upper bound on a rendezvous call
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Wait between port mapping attempts
    pub fn nat_retry_wait(&self) -> Duration {
        Duration::from_secs(self.nat_retry_wait_secs)
    }
}

impl MessengerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or fails validation
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        } else {
            for location in Self::default_locations() {
                if location.exists() {
                    config = Self::from_file(&location)?;
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Config file locations searched when none is given explicitly
    pub fn default_locations() -> Vec<PathBuf> {
        vec![
            PathBuf::from(DEFAULT_CONFIG_FILE),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("overlay-messenger")
                .join(DEFAULT_CONFIG_FILE),
        ]
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn merge_from_env(self) -> Result<Self> {
        self.merge_from_vars(env_var)
    }

    fn merge_from_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(port) = var(&format!("{ENV_PREFIX}_NETWORK_LISTEN_PORT")) {
            self.network.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_NETWORK_LISTEN_PORT"),
                value: port,
            })?;
        }

        if let Some(servers) = var(&format!("{ENV_PREFIX}_NETWORK_RENDEZVOUS_SERVERS")) {
            self.network.rendezvous_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(level) = var(&format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Some(data_dir) = var(&format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self.storage.data_dir = PathBuf::from(data_dir);
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.network.listen_port == 0 {
            return Err(invalid("network.listen_port", "0"));
        }

        for server in &self.network.rendezvous_servers {
            if !(server.starts_with("http://") || server.starts_with("https://")) {
                return Err(invalid("network.rendezvous_servers", server));
            }
        }

        let timing = &self.timing;
        for (field, value) in [
            ("timing.sync_interval_secs", timing.sync_interval_secs),
            ("timing.retry_interval_ms", timing.retry_interval_ms),
            ("timing.dht_query_timeout_secs", timing.dht_query_timeout_secs),
            ("timing.http_timeout_secs", timing.http_timeout_secs),
            ("timing.nat_attempts", u64::from(timing.nat_attempts)),
        ] {
            if value == 0 {
                return Err(invalid(field, "0"));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => return Err(invalid("logging.level", other)),
        }

        Ok(())
    }

    /// Ensure the data directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        let dir = &self.storage.data_dir;
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                path: dir.display().to_string(),
            })?;
        }
        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: &str) -> crate::utils::MessengerError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

/// Source of the rendezvous server list, consulted once per sync cycle
pub trait ServerList: Send + Sync {
    /// Current list of rendezvous server base URIs
    fn rendezvous_servers(&self) -> Vec<String>;
}

/// A fixed server list
#[derive(Debug, Clone, Default)]
pub struct StaticServers(pub Vec<String>);

impl ServerList for StaticServers {
    fn rendezvous_servers(&self) -> Vec<String> {
        self.0.clone()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Server list re-read from the config file on every call, so it can be
/// edited while the node runs. Environment overrides still win.
pub struct ConfigFileServers {
    path: PathBuf,
    last_good: Mutex<Vec<String>>,
    vars: fn(&str) -> Option<String>,
}

impl ConfigFileServers {
    /// Watch `path`, starting from `initial` until the file yields a valid list
    pub fn new(path: PathBuf, initial: Vec<String>) -> Self {
        Self {
            path,
            last_good: Mutex::new(initial),
            vars: env_var,
        }
    }

    #[cfg(test)]
    fn with_vars(mut self, vars: fn(&str) -> Option<String>) -> Self {
        self.vars = vars;
        self
    }
}

impl ServerList for ConfigFileServers {
    fn rendezvous_servers(&self) -> Vec<String> {
        let reloaded = MessengerConfig::from_file(&self.path).and_then(|c| c.merge_from_vars(self.vars));
        match reloaded {
            Ok(config) => {
                let servers = config.network.rendezvous_servers;
                *self.last_good.lock() = servers.clone();
                servers
            }
            Err(e) => {
                log::debug!("Keeping previous server list, config reload failed: {}", e);
                self.last_good.lock().clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MessengerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.listen_port, crate::defaults::DEFAULT_PORT);
        assert_eq!(config.timing.nat_attempts, 3);
        assert!(config.network.rendezvous_servers.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let config = MessengerConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("listen_port"));
        assert!(toml_str.contains("rendezvous_servers"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = MessengerConfig::default();
        config.network.rendezvous_servers = vec!["https://rv.example.org".to_string()];
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded_config = MessengerConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(config.network.listen_port, loaded_config.network.listen_port);
        assert_eq!(
            config.network.rendezvous_servers,
            loaded_config.network.rendezvous_servers
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = MessengerConfig::default();
        assert!(config.validate().is_ok());

        config.network.listen_port = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.timing.retry_interval_ms = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.network.rendezvous_servers = vec!["ftp://nope".to_string()];
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    fn servers_override(name: &str) -> Option<String> {
        (name == "MESSENGER_NETWORK_RENDEZVOUS_SERVERS")
            .then(|| "https://a.example, https://b.example".to_string())
    }

    fn no_override(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_env_override() {
        let config = MessengerConfig::default()
            .merge_from_vars(servers_override)
            .unwrap();
        assert_eq!(
            config.network.rendezvous_servers,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_config_file_servers_keep_env_override() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut config = MessengerConfig::default();
        config.network.rendezvous_servers = vec!["https://one.example".to_string()];
        config.save(temp_file.path()).unwrap();

        let servers = ConfigFileServers::new(temp_file.path().to_path_buf(), Vec::new())
            .with_vars(servers_override);
        assert_eq!(
            servers.rendezvous_servers(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_config_file_servers_follow_edits() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut config = MessengerConfig::default();
        config.network.rendezvous_servers = vec!["https://one.example".to_string()];
        config.save(temp_file.path()).unwrap();

        let servers =
            ConfigFileServers::new(temp_file.path().to_path_buf(), Vec::new()).with_vars(no_override);
        assert_eq!(servers.rendezvous_servers(), vec!["https://one.example".to_string()]);

        config.network.rendezvous_servers = vec!["https://two.example".to_string()];
        config.save(temp_file.path()).unwrap();
        assert_eq!(servers.rendezvous_servers(), vec!["https://two.example".to_string()]);

        std::fs::write(temp_file.path(), "not toml [").unwrap();
        assert_eq!(servers.rendezvous_servers(), vec!["https://two.example".to_string()]);
    }
}

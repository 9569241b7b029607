//! Configuration management module for MeshTunnel.
//!
//! This module provides functionality for loading, parsing, validating and
//! overriding the configuration of a node, both for the provider side
//! (advertised services) and the consumer side (outbound connections).

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Service types a node knows how to run.
pub const KNOWN_SERVICE_TYPES: &[&str] = &["noop", "openvpn", "wireguard"];

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Which address a provider hands to consumers when its public IP and its
/// outbound (local interface) IP disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerAddressPolicy {
    /// Outbound IP on localnet, public IP otherwise
    #[default]
    Auto,
    /// Always the publicly visible IP
    Public,
    /// Always the outbound IP
    Outbound,
}

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output
    #[default]
    Compact,
    /// Multi-line output with field per line, for development
    Pretty,
    /// One JSON object per event
    Json,
}

/// Log output settings. The level itself is the top-level `log_level`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Per-component filter directives, e.g. `"mesh_dialog=debug"`
    #[serde(default)]
    pub directives: Vec<String>,

    /// Write daily-rotated log files into this directory as well
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Network configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Address of the broker relaying dialogs (default: "nats://127.0.0.1:4222")
    #[serde(default = "default_broker_address")]
    pub broker_address: String,

    /// Whether the node runs on a local test network (default: false)
    #[serde(default)]
    pub localnet: bool,

    /// Server address policy used when public and outbound IPs differ
    #[serde(default)]
    pub server_address_policy: ServerAddressPolicy,
}

fn default_broker_address() -> String {
    "nats://127.0.0.1:4222".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            broker_address: default_broker_address(),
            localnet: false,
            server_address_policy: ServerAddressPolicy::default(),
        }
    }
}

/// Identity and keystore settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityConfig {
    /// Directory holding the keystore and the identity cache
    #[serde(default = "default_keystore_dir")]
    pub keystore_dir: PathBuf,

    /// File name of the last-used identity cache (default: "remember.json")
    #[serde(default = "default_cache_file")]
    pub cache_file: String,

    /// Identity address to use; empty means last used, then a new one
    #[serde(default)]
    pub address: Option<String>,

    /// Passphrase used to unlock the identity
    #[serde(default)]
    pub passphrase: String,
}

fn default_keystore_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("meshtunnel").join("keystore"))
        .unwrap_or_else(|| PathBuf::from("keystore"))
}

fn default_cache_file() -> String {
    "remember.json".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            keystore_dir: default_keystore_dir(),
            cache_file: default_cache_file(),
            address: None,
            passphrase: String::new(),
        }
    }
}

/// OpenVPN-style service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenvpnSettings {
    /// Port the OpenVPN server listens on (default: 1194)
    #[serde(default = "default_openvpn_port")]
    pub port: u16,

    /// Transport protocol, "udp" or "tcp" (default: "udp")
    #[serde(default = "default_openvpn_protocol")]
    pub protocol: String,
}

fn default_openvpn_port() -> u16 {
    1194
}

fn default_openvpn_protocol() -> String {
    "udp".to_string()
}

impl Default for OpenvpnSettings {
    fn default() -> Self {
        OpenvpnSettings {
            port: default_openvpn_port(),
            protocol: default_openvpn_protocol(),
        }
    }
}

/// WireGuard-style service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireguardSettings {
    /// UDP port the WireGuard interface listens on (default: 51820)
    #[serde(default = "default_wireguard_port")]
    pub listen_port: u16,

    /// Subnet consumers get their tunnel address from (default: "10.182.0.0/24")
    #[serde(default = "default_wireguard_subnet")]
    pub subnet: String,
}

fn default_wireguard_port() -> u16 {
    51820
}

fn default_wireguard_subnet() -> String {
    "10.182.0.0/24".to_string()
}

impl Default for WireguardSettings {
    fn default() -> Self {
        WireguardSettings {
            listen_port: default_wireguard_port(),
            subnet: default_wireguard_subnet(),
        }
    }
}

/// Commands used to bring the data plane up and down.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineSettings {
    /// Command run to bring a tunnel up; tunnel parameters are passed in the environment
    #[serde(default)]
    pub up_command: Vec<String>,

    /// Command run to bring a tunnel down
    #[serde(default)]
    pub down_command: Vec<String>,
}

/// Provider-specific configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Service types started by `provide` (default: ["noop"])
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    /// Interval between proposal re-announcements in seconds (default: 60)
    #[serde(default = "default_proposal_refresh_secs")]
    pub proposal_refresh_secs: u64,

    /// OpenVPN-style service settings
    #[serde(default)]
    pub openvpn: OpenvpnSettings,

    /// WireGuard-style service settings
    #[serde(default)]
    pub wireguard: WireguardSettings,

    /// Data plane engine commands
    #[serde(default)]
    pub engine: EngineSettings,
}

fn default_services() -> Vec<String> {
    vec!["noop".to_string()]
}

fn default_proposal_refresh_secs() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            services: default_services(),
            proposal_refresh_secs: default_proposal_refresh_secs(),
            openvpn: OpenvpnSettings::default(),
            wireguard: WireguardSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

impl ProviderConfig {
    /// Returns the proposal refresh interval as a [`Duration`].
    pub fn proposal_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.proposal_refresh_secs)
    }
}

/// Consumer-specific configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    /// Timeout for dialog open and request round-trips in milliseconds (default: 10000)
    #[serde(default = "default_dialog_timeout_ms")]
    pub dialog_timeout_ms: u64,

    /// Timeout waiting for the tunnel to report an established connection (default: 30000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_dialog_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            dialog_timeout_ms: default_dialog_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ConsumerConfig {
    pub fn dialog_timeout(&self) -> Duration {
        Duration::from_millis(self.dialog_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// NAT traversal settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatConfig {
    /// Enable the rendezvous ping exchange (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local UDP address used for punching (default: "0.0.0.0:0")
    #[serde(default = "default_nat_bind_address")]
    pub bind_address: String,

    /// Overall rendezvous timeout in milliseconds (default: 10000)
    #[serde(default = "default_nat_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum number of punch attempts (default: 8)
    #[serde(default = "default_nat_max_attempts")]
    pub max_attempts: u32,

    /// Spacing before the second attempt in milliseconds; doubles each attempt (default: 100)
    #[serde(default = "default_nat_initial_spacing_ms")]
    pub initial_spacing_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_nat_bind_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_nat_timeout_ms() -> u64 {
    10_000
}

fn default_nat_max_attempts() -> u32 {
    8
}

fn default_nat_initial_spacing_ms() -> u64 {
    100
}

impl Default for NatConfig {
    fn default() -> Self {
        NatConfig {
            enabled: default_true(),
            bind_address: default_nat_bind_address(),
            timeout_ms: default_nat_timeout_ms(),
            max_attempts: default_nat_max_attempts(),
            initial_spacing_ms: default_nat_initial_spacing_ms(),
        }
    }
}

impl NatConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_spacing(&self) -> Duration {
        Duration::from_millis(self.initial_spacing_ms)
    }
}

/// Promise engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromiseConfig {
    /// Issue and validate real promises (default: false, no-op engines)
    #[serde(default)]
    pub check_enabled: bool,

    /// Seconds between promise increments (default: 60)
    #[serde(default = "default_issue_interval_secs")]
    pub issue_interval_secs: u64,

    /// Amount promised per interval, in the smallest currency unit (default: 100)
    #[serde(default = "default_price_per_interval")]
    pub price_per_interval: u64,
}

fn default_issue_interval_secs() -> u64 {
    60
}

fn default_price_per_interval() -> u64 {
    100
}

impl Default for PromiseConfig {
    fn default() -> Self {
        PromiseConfig {
            check_enabled: false,
            issue_interval_secs: default_issue_interval_secs(),
            price_per_interval: default_price_per_interval(),
        }
    }
}

impl PromiseConfig {
    pub fn issue_interval(&self) -> Duration {
        Duration::from_secs(self.issue_interval_secs)
    }
}

/// Main configuration structure for MeshTunnel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Consumer configuration
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// NAT traversal configuration
    #[serde(default)]
    pub nat: NatConfig,

    /// Promise engine configuration
    #[serde(default)]
    pub promises: PromiseConfig,

    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: NetworkConfig::default(),
            identity: IdentityConfig::default(),
            provider: ProviderConfig::default(),
            consumer: ConsumerConfig::default(),
            nat: NatConfig::default(),
            promises: PromiseConfig::default(),
            log_level: default_log_level(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment variables take precedence over the file
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.broker_address.trim().is_empty() {
            return Err(ConfigError::MissingValue(
                "network.broker_address".to_string(),
            ));
        }

        for service in &self.provider.services {
            if !KNOWN_SERVICE_TYPES.contains(&service.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "provider.services".to_string(),
                    message: format!("unknown service type: {}", service),
                });
            }
        }

        if !matches!(self.provider.openvpn.protocol.as_str(), "udp" | "tcp") {
            return Err(ConfigError::InvalidValue {
                key: "provider.openvpn.protocol".to_string(),
                message: "must be \"udp\" or \"tcp\"".to_string(),
            });
        }

        let non_zero = [
            ("provider.proposal_refresh_secs", self.provider.proposal_refresh_secs),
            ("consumer.dialog_timeout_ms", self.consumer.dialog_timeout_ms),
            ("consumer.connect_timeout_ms", self.consumer.connect_timeout_ms),
            ("nat.timeout_ms", self.nat.timeout_ms),
            ("nat.max_attempts", u64::from(self.nat.max_attempts)),
            ("promises.issue_interval_secs", self.promises.issue_interval_secs),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: MESHTUNNEL_)
    /// Example keys:
    /// - MESHTUNNEL_LOG_LEVEL, MESHTUNNEL_LOGGING_FORMAT, MESHTUNNEL_LOGGING_DIRECTIVES
    /// - MESHTUNNEL_NETWORK_BROKER_ADDRESS, MESHTUNNEL_NETWORK_LOCALNET, MESHTUNNEL_NETWORK_SERVER_ADDRESS_POLICY
    /// - MESHTUNNEL_IDENTITY_ADDRESS, MESHTUNNEL_IDENTITY_PASSPHRASE, MESHTUNNEL_IDENTITY_KEYSTORE_DIR
    /// - MESHTUNNEL_PROVIDER_SERVICES
    /// - MESHTUNNEL_NAT_ENABLED, MESHTUNNEL_NAT_BIND_ADDRESS, MESHTUNNEL_NAT_TIMEOUT_MS
    /// - MESHTUNNEL_PROMISES_CHECK_ENABLED
    fn apply_env_overrides(cfg: &mut Config) {
        use std::env;

        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }
        fn split_csv(s: &str) -> Vec<String> {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        }

        if let Ok(v) = env::var("MESHTUNNEL_LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Ok(v) = env::var("MESHTUNNEL_LOGGING_FORMAT") {
            match v.to_ascii_lowercase().as_str() {
                "compact" => cfg.logging.format = LogFormat::Compact,
                "pretty" => cfg.logging.format = LogFormat::Pretty,
                "json" => cfg.logging.format = LogFormat::Json,
                _ => {}
            }
        }
        if let Ok(v) = env::var("MESHTUNNEL_LOGGING_DIRECTIVES") {
            cfg.logging.directives = split_csv(&v);
        }

        // Network
        if let Ok(v) = env::var("MESHTUNNEL_NETWORK_BROKER_ADDRESS") {
            if !v.is_empty() {
                cfg.network.broker_address = v;
            }
        }
        if let Ok(v) = env::var("MESHTUNNEL_NETWORK_LOCALNET") {
            if let Some(b) = parse_bool(&v) {
                cfg.network.localnet = b;
            }
        }
        if let Ok(v) = env::var("MESHTUNNEL_NETWORK_SERVER_ADDRESS_POLICY") {
            cfg.network.server_address_policy = match v.to_ascii_lowercase().as_str() {
                "public" => ServerAddressPolicy::Public,
                "outbound" => ServerAddressPolicy::Outbound,
                _ => ServerAddressPolicy::Auto,
            };
        }

        // Identity
        if let Ok(v) = env::var("MESHTUNNEL_IDENTITY_ADDRESS") {
            if !v.is_empty() {
                cfg.identity.address = Some(v);
            }
        }
        if let Ok(v) = env::var("MESHTUNNEL_IDENTITY_PASSPHRASE") {
            cfg.identity.passphrase = v;
        }
        if let Ok(v) = env::var("MESHTUNNEL_IDENTITY_KEYSTORE_DIR") {
            if !v.is_empty() {
                cfg.identity.keystore_dir = PathBuf::from(v);
            }
        }

        // Provider
        if let Ok(v) = env::var("MESHTUNNEL_PROVIDER_SERVICES") {
            let list = split_csv(&v);
            if !list.is_empty() {
                cfg.provider.services = list;
            }
        }

        // NAT
        if let Ok(v) = env::var("MESHTUNNEL_NAT_ENABLED") {
            if let Some(b) = parse_bool(&v) {
                cfg.nat.enabled = b;
            }
        }
        if let Ok(v) = env::var("MESHTUNNEL_NAT_BIND_ADDRESS") {
            if !v.is_empty() {
                cfg.nat.bind_address = v;
            }
        }
        if let Ok(v) = env::var("MESHTUNNEL_NAT_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.nat.timeout_ms = n;
            }
        }

        // Promises
        if let Ok(v) = env::var("MESHTUNNEL_PROMISES_CHECK_ENABLED") {
            if let Some(b) = parse_bool(&v) {
                cfg.promises.check_enabled = b;
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("meshtunnel").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }

    /// Path of the last-used identity cache file.
    pub fn identity_cache_path(&self) -> PathBuf {
        self.identity.keystore_dir.join(&self.identity.cache_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.broker_address, "nats://127.0.0.1:4222");
        assert_eq!(config.provider.services, vec!["noop".to_string()]);
        assert_eq!(config.identity.cache_file, "remember.json");
        assert!(!config.promises.check_enabled);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();

        let config_str = r#"
            log_level = "debug"

            [network]
            broker_address = "nats://broker.example:4222"
            localnet = true
            server_address_policy = "outbound"

            [provider]
            services = ["openvpn", "wireguard"]
            proposal_refresh_secs = 30

            [provider.openvpn]
            port = 1195
            protocol = "tcp"

            [nat]
            max_attempts = 4

            [promises]
            check_enabled = true

            [logging]
            format = "json"
            directives = ["mesh_dialog=debug"]
        "#;

        file.write_all(config_str.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.network.broker_address, "nats://broker.example:4222");
        assert!(config.network.localnet);
        assert_eq!(
            config.network.server_address_policy,
            ServerAddressPolicy::Outbound
        );
        assert_eq!(
            config.provider.services,
            vec!["openvpn".to_string(), "wireguard".to_string()]
        );
        assert_eq!(config.provider.proposal_refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.provider.openvpn.port, 1195);
        assert_eq!(config.provider.openvpn.protocol, "tcp");
        assert_eq!(config.provider.wireguard.listen_port, 51820);
        assert_eq!(config.nat.max_attempts, 4);
        assert!(config.promises.check_enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.directives, vec!["mesh_dialog=debug".to_string()]);
        assert!(config.logging.dir.is_none());
    }

    #[test]
    fn test_save_config() {
        let config = Config {
            log_level: "debug".to_string(),
            provider: ProviderConfig {
                services: vec!["wireguard".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded_config = Config::load(file.path()).unwrap();

        assert_eq!(loaded_config.log_level, "debug");
        assert_eq!(loaded_config.provider.services, vec!["wireguard".to_string()]);
    }

    #[test]
    fn test_validation() {
        let config = Config {
            provider: ProviderConfig {
                services: vec!["ipsec".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "provider.services"
        ));

        let config = Config {
            nat: NatConfig {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            network: NetworkConfig {
                broker_address: " ".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingValue(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load("/definitely/not/here/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}

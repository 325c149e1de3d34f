// Configuration management for LANlink
//
// Cross-platform config stored in:
// - macOS: ~/.config/lanlink/config.json
// - Linux: ~/.config/lanlink/config.json
// - Windows: %APPDATA%\lanlink\config.json
//
// Environment variables override file values:
// LANLINK_MODE, LANLINK_API_HOST, LANLINK_API_PORT, LANLINK_RELAY_IP,
// LANLINK_CONTROL_URL

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Default STUN servers used for NAT probing
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun3.l.google.com:19302",
    "stun4.l.google.com:19302",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to determine config directory")]
    NoConfigDir,
    #[error("invalid config value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Process role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Overlay client: tunnels, broadcast emulation, party membership
    Client,
    /// Stateless UDP relay server
    Relay,
    /// Control-plane server
    Control,
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Mode::Client),
            "relay" => Ok(Mode::Relay),
            "control" => Ok(Mode::Control),
            other => Err(ConfigError::InvalidValue {
                key: "mode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// LANlink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Process role
    pub mode: Mode,

    /// Base overlay network in CIDR notation
    pub virtual_subnet: String,

    /// Tunnel interface name handed to the data-plane
    pub interface_name: String,

    /// Local UDP port the tunnel (and hole punching) binds to
    pub tunnel_port: u16,

    /// Local API settings
    pub api_host: String,
    pub api_port: u16,

    /// Control-plane server URL
    pub control_url: String,

    /// Relay settings (for relay mode, or as a configured fallback relay)
    pub relay_public_ip: Option<String>,
    pub relay_port: u16,

    /// STUN servers for NAT probing
    pub stun_servers: Vec<String>,

    /// Paths
    pub config_dir: PathBuf,
    pub keys_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = Self::default_config_dir();
        let keys_dir = config_dir.join("keys");
        Self {
            mode: Mode::Client,
            virtual_subnet: "10.66.0.0/16".to_string(),
            interface_name: "lanlink0".to_string(),
            tunnel_port: 51820,
            api_host: "127.0.0.1".to_string(),
            api_port: 8666,
            control_url: "http://127.0.0.1:8667".to_string(),
            relay_public_ip: None,
            relay_port: 51820,
            stun_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            config_dir,
            keys_dir,
        }
    }
}

impl Config {
    fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanlink")
    }

    /// Config file path
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Load config from file (if present), then apply environment overrides
    /// and ensure directories exist.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let file = config.config_file();
        if file.exists() {
            let contents = std::fs::read_to_string(&file)?;
            config = serde_json::from_str(&contents)?;
        }

        config.apply_env_overrides()?;

        std::fs::create_dir_all(&config.config_dir)?;
        std::fs::create_dir_all(&config.keys_dir)?;

        Ok(config)
    }

    /// Save config to its file
    pub fn save(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.config_dir)?;
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(self.config_file(), contents)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(mode) = std::env::var("LANLINK_MODE") {
            self.mode = mode.parse()?;
        }
        if let Ok(host) = std::env::var("LANLINK_API_HOST") {
            self.api_host = host;
        }
        if let Ok(port) = std::env::var("LANLINK_API_PORT") {
            self.api_port = port
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "api_port".to_string(),
                    value: port.clone(),
                })?;
        }
        if let Ok(ip) = std::env::var("LANLINK_RELAY_IP") {
            self.relay_public_ip = Some(ip);
        }
        if let Ok(url) = std::env::var("LANLINK_CONTROL_URL") {
            self.control_url = url;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.virtual_subnet, "10.66.0.0/16");
        assert_eq!(config.tunnel_port, 51820);
        assert!(!config.stun_servers.is_empty());
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.mode, config.mode);
        assert_eq!(parsed.virtual_subnet, config.virtual_subnet);
        assert_eq!(parsed.api_port, config.api_port);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("client".parse::<Mode>().unwrap(), Mode::Client);
        assert_eq!("relay".parse::<Mode>().unwrap(), Mode::Relay);
        assert_eq!("control".parse::<Mode>().unwrap(), Mode::Control);
        assert!("server".parse::<Mode>().is_err());
    }
}

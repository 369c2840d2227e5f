use std::{error::Error, fmt, fs, io};

use serde::Deserialize;

const CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub disk: DiskConfig,
    pub network: NetworkConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiskConfig {
    pub download_path: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub max_peer_connections: usize,
    pub connect_timeout_ms: u64,
    pub connection_retries: u32,
    /// Port reported to the tracker. No inbound listener is bound; outgoing
    /// connections only.
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum outstanding block requests per peer.
    pub pipeline_depth: usize,
    /// Unchoke slot budget for the choking rounds.
    pub upload_slots: usize,
    pub request_timeout_secs: u64,
    pub choke_interval_secs: u64,
    /// The optimistic slot is re-rolled every this many choking rounds.
    pub optimistic_rounds: u64,
    pub event_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            disk: DiskConfig::default(),
            network: NetworkConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            download_path: "./downloads/".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            max_peer_connections: 40,
            connect_timeout_ms: 3000,
            connection_retries: 2,
            port: 6881,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            pipeline_depth: 10,
            upload_slots: 4,
            request_timeout_secs: 60,
            choke_interval_secs: 10,
            optimistic_rounds: 3,
            event_queue_capacity: 256,
        }
    }
}

impl Config {
    pub fn load() -> Result<Config, ConfigError> {
        Self::load_from(CONFIG_PATH)
    }

    fn load_from(path: &str) -> Result<Config, ConfigError> {
        let toml_str = fs::read_to_string(path)?;
        let config: Config = toml::de::from_str(&toml_str)?;

        Ok(config)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "Failed to read config file: {}", err),
            ConfigError::Parse(err) => write!(f, "Failed to parse config file: {}", err),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}

//! Server configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use depot::BackendConfig;
use depot::transfer::{MAX_MESSAGE_SIZE, frame_size_for};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or validating a [`ServerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The config file is not valid JSON for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A setting is out of range or inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything a server needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Identifies this server in logs.
    #[serde(default)]
    pub id: String,
    /// Listen address.
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
    /// Storage backend.
    pub backend: BackendConfig,
    /// Largest gRPC message accepted or sent, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Per-request deadline enforced by the server.
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

impl ServerConfig {
    /// A config with defaults for everything but the backend.
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            id: String::new(),
            addr: default_addr(),
            backend,
            max_message_size: default_max_message_size(),
            request_timeout: None,
        }
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Largest data payload per frame under this config.
    pub fn frame_size(&self) -> Result<usize, ConfigError> {
        frame_size_for(self.max_message_size).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "max_message_size {} leaves no room for data",
                self.max_message_size
            ))
        })
    }

    /// Check settings that can be checked before anything is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.frame_size()?;
        if let BackendConfig::Local { path } = &self.backend {
            match std::fs::metadata(path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "path '{}' is not a directory",
                        path.display()
                    )));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ConfigError::Invalid(format!(
                        "path '{}' doesn't exist",
                        path.display()
                    )));
                }
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        if self.request_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("request_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Command-line flags for running a server, shared by the server binaries.
///
/// Flags override values loaded from `--config`.
#[derive(Debug, Clone, clap::Args)]
pub struct ServerArgs {
    /// JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Server id used in logs
    #[arg(long)]
    pub id: Option<String>,
    /// Address to listen on
    #[arg(long)]
    pub addr: Option<SocketAddr>,
    /// Directory holding the stored files
    #[arg(long, conflicts_with = "memory")]
    pub path: Option<PathBuf>,
    /// Keep files in memory instead of on disk
    #[arg(long)]
    pub memory: bool,
    /// Largest gRPC message in bytes
    #[arg(long)]
    pub max_message_size: Option<usize>,
    /// Per-request deadline in milliseconds
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,
}

impl ServerArgs {
    /// Merge flags over the config file, if any.
    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let backend = match (self.path, self.memory) {
            (Some(path), _) => Some(BackendConfig::Local { path }),
            (None, true) => Some(BackendConfig::Memory),
            (None, false) => None,
        };

        let mut config = match (self.config, backend) {
            (Some(file), backend) => {
                let mut config = ServerConfig::from_file(file)?;
                if let Some(backend) = backend {
                    config.backend = backend;
                }
                config
            }
            (None, Some(backend)) => ServerConfig::new(backend),
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "one of --path, --memory or --config is required".into(),
                ));
            }
        };

        if let Some(id) = self.id {
            config.id = id;
        }
        if let Some(addr) = self.addr {
            config.addr = addr;
        }
        if let Some(size) = self.max_message_size {
            config.max_message_size = size;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout = Some(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

/// Optional durations as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}

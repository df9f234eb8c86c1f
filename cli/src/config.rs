use std::path::{Path, PathBuf};
use std::time::Duration;

use cls_rpc::ConnectionConfig;
use cls_rpc::codec::DEFAULT_MAX_FRAME_BYTES;
use cls_service::ServiceConfig;
use serde::Deserialize;

/// Contents of `~/.cls/config.toml`. Every section and key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClsConfig {
    pub log: LogConfig,
    pub rpc: RpcConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub max_frame_bytes: usize,
    /// Unset means outgoing requests wait indefinitely.
    pub request_timeout_ms: Option<u64>,
    pub strict_responses: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            request_timeout_ms: None,
            strict_responses: false,
        }
    }
}

impl RpcConfig {
    pub fn connection_config(&self, name: &str) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_string(),
            max_frame_bytes: self.max_frame_bytes,
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
            strict_responses: self.strict_responses,
        }
    }
}

impl ClsConfig {
    /// Loads the default config file. `Ok(None)` when there is none.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Loads an explicitly named config file, which must exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cls").join("config.toml"))
}

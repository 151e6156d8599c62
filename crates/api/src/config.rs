//! Layered application configuration
//!
//! An optional TOML file is read first, then environment variables prefixed
//! `DSA_` override it, with `__` separating nested keys
//! (`DSA_SERVER__ADDR=0.0.0.0:9000`).

use config::{Config, ConfigError, Environment, File};
use dms::DmsConfig;
use serde::Deserialize;
use storage::TempStoreConfig;
use video_source::DecoderConfig;

use crate::rate_limit::RateLimitConfig;

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/default";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "DSA";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub rate_limit: RateLimitConfig,
    pub storage: TempStoreConfig,
    pub decoder: DecoderConfig,
    pub analysis: DmsConfig,
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` (extension optional, file optional) and the environment
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub addr: String,
    /// The single origin allowed to make credentialed cross-origin requests
    pub allowed_origin: String,
    /// Largest accepted upload body
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            allowed_origin: "http://localhost:5173".to_string(),
            max_upload_bytes: 200 * 1024 * 1024,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level: trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

//! Configuration for bus members.
//!
//! Supports YAML files and environment variable overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::address::{Uid, DEFAULT_BASE_PATH};
use crate::transport::{TransportConfig, DEFAULT_MAX_FRAME_LEN};

/// Config file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "ipsee";

/// Environment variable naming an additional config file.
pub const CONFIG_ENV_VAR: &str = "IPSEE_CONFIG";

/// Prefix for environment overrides, e.g. `IPSEE__BUS__UID=7`.
pub const CONFIG_ENV_PREFIX: &str = "IPSEE";

/// Per-member options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusOptions {
    /// Member uid. Defaults to the process id.
    #[serde(deserialize_with = "deserialize_uid")]
    pub uid: Uid,
    /// Directory holding the namespace's sockets.
    pub path: PathBuf,
    /// Bound on each outward connect, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Bound on the hello exchange, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Largest frame sent or accepted, in bytes.
    pub max_frame_len: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            uid: Uid::current_process(),
            path: PathBuf::from(DEFAULT_BASE_PATH),
            connect_timeout_ms: 2000,
            handshake_timeout_ms: 2000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl BusOptions {
    /// Use `uid` instead of the process id.
    pub fn with_uid(mut self, uid: impl Into<Uid>) -> Self {
        self.uid = uid.into();
        self
    }

    /// Place sockets under `path`.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl From<&BusOptions> for TransportConfig {
    fn from(opts: &BusOptions) -> Self {
        Self {
            connect_timeout: Duration::from_millis(opts.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(opts.handshake_timeout_ms),
            max_frame_len: opts.max_frame_len,
        }
    }
}

/// Numeric text in config files (`uid: "7"`) means the numeric uid.
fn deserialize_uid<'de, D>(deserializer: D) -> Result<Uid, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Uid::deserialize(deserializer)? {
        Uid::Name(name) => Uid::from(name),
        num => num,
    })
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespace to join, for binaries that take it from config.
    pub namespace: Option<String>,
    /// Member options.
    pub bus: BusOptions,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `ipsee.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `IPSEE_CONFIG` environment variable (if set)
    /// 4. Environment variables with `IPSEE` prefix and `__` separator
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

//! Configuration management.
//!
//! Configuration lives in a TOML file. The read-path knobs sit at the top
//! level (`large`, `chunk`, `browse`); store, backup and HTTP settings live
//! in their own tables:
//!
//! ```toml
//! large = 67108864
//! chunk = 8388608
//! browse = true
//!
//! [store]
//! root = "/var/lib/dedupfs/objects"
//!
//! [backup]
//! retry_initial_ms = 10000
//! retry_max_attempts = 3
//! throttle = 0
//!
//! [http]
//! listen = "0.0.0.0:1549"
//! username = "kodi"
//! ```
//!
//! The file is validated once when loaded; an invalid file is fatal.
//! [`init_config`] installs a process-wide copy for the binary, library types
//! take the values they need explicitly.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment variable that overrides `http.password`.
pub const PASSWORD_ENV: &str = "DEDUPFS_PASSWORD";

const MIB: u64 = 1024 * 1024;

static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Blobs larger than this many bytes are read in chunks.
    pub large: u64,
    /// Bytes per chunked read; must not exceed `large`.
    pub chunk: u64,
    /// Whether directories may be enumerated through the front ends.
    pub browse: bool,
    pub store: StoreConfig,
    pub backup: BackupConfig,
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            large: 64 * MIB,
            chunk: 8 * MIB,
            browse: true,
            store: StoreConfig::default(),
            backup: BackupConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding blobs and their metadata.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/dedupfs/objects"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    pub retry_initial_ms: u64,
    pub retry_max_interval_ms: u64,
    /// Retries after the first attempt.
    pub retry_max_attempts: u32,
    /// Upload limit in bytes per second, 0 for unlimited.
    pub throttle: u64,
    /// Bucket capacity in bytes; defaults to one second of `throttle`.
    pub throttle_burst: Option<u64>,
    /// Skip hashing files whose size and mtime match the prescan.
    pub trust_prescan: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retry_initial_ms: 10_000,
            retry_max_interval_ms: 60_000,
            retry_max_attempts: 3,
            throttle: 0,
            throttle_burst: None,
            trust_prescan: true,
        }
    }
}

impl BackupConfig {
    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_millis(self.retry_max_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub listen: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:1549".to_string(),
            username: None,
            password: None,
            realm: "Access to list and stream titles".to_string(),
        }
    }
}

/// The validated read-path settings shared by both front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadConfig {
    pub large_threshold: u64,
    pub chunk_size: usize,
    pub browse: bool,
}

impl ReadConfig {
    pub fn new(large_threshold: u64, chunk_size: u64, browse: bool) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk must be greater than zero".into()));
        }
        if chunk_size > large_threshold {
            return Err(Error::Config(format!(
                "chunk ({chunk_size}) must not exceed large ({large_threshold})"
            )));
        }
        let chunk_size = usize::try_from(chunk_size)
            .map_err(|_| Error::Config(format!("chunk ({chunk_size}) too large")))?;
        Ok(Self {
            large_threshold,
            chunk_size,
            browse,
        })
    }
}

impl Config {
    /// Read, parse and validate a config file. `DEDUPFS_PASSWORD`, when set,
    /// replaces `http.password`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// The file at `path` if given, the defaults otherwise; environment
    /// overrides apply either way.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.is_empty() {
                self.http.password = Some(password);
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(format!("parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.read_config()?;
        if self.backup.throttle > 0 && self.backup.throttle_burst == Some(0) {
            return Err(Error::Config(
                "backup.throttle_burst must be positive when throttling".into(),
            ));
        }
        Ok(())
    }

    pub fn read_config(&self) -> Result<ReadConfig> {
        ReadConfig::new(self.large, self.chunk, self.browse)
    }
}

/// Install the process-wide configuration from a file.
pub fn init_config(path: impl AsRef<Path>) -> std::result::Result<(), String> {
    let config = Config::load(path).map_err(|e| e.to_string())?;
    init_with(config)
}

/// Install an already-built configuration.
pub fn init_with(config: Config) -> std::result::Result<(), String> {
    CONFIG
        .set(config)
        .map_err(|_| "config already initialized".to_string())
}

/// The process-wide configuration, or the defaults if none was installed.
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.browse);
        assert!(config.chunk <= config.large);
        assert_eq!(config.backup.retry_max_attempts, 3);
    }

    #[test]
    fn chunk_larger_than_large_is_fatal() {
        let err = Config::from_toml_str("large = 1024\nchunk = 4096\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[test]
    fn zero_chunk_is_fatal() {
        assert!(Config::from_toml_str("chunk = 0\n").is_err());
    }

    #[test]
    fn tables_parse() {
        let config = Config::from_toml_str(
            r#"
large = 100
chunk = 10
browse = false

[store]
root = "/tmp/objects"

[backup]
retry_initial_ms = 5
throttle = 2048

[http]
listen = "127.0.0.1:8080"
username = "kodi"
password = "secret"
"#,
        )
        .unwrap();
        let read = config.read_config().unwrap();
        assert_eq!(read.large_threshold, 100);
        assert_eq!(read.chunk_size, 10);
        assert!(!read.browse);
        assert_eq!(config.store.root, PathBuf::from("/tmp/objects"));
        assert_eq!(config.backup.retry_initial(), Duration::from_millis(5));
        assert_eq!(config.backup.throttle, 2048);
        assert_eq!(config.http.username.as_deref(), Some("kodi"));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(Config::from_toml_str("chunck = 10\n").is_err());
    }
}

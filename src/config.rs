//! Server configuration.
//!
//! Loaded from a TOML file; every field has a default, so an empty file (or
//! no file) gives a working single-host setup.
//!
//! ```toml
//! [listener]
//! host = "0.0.0.0"
//! port = 0
//!
//! [announce]
//! prefix = "/tmp/drms_export"
//! syntax = "csh"
//!
//! [sums]
//! enabled = true
//! root = "/var/drms/sums"
//! retention_days = 7
//!
//! [shutdown]
//! wait_for_clients = "never"
//! ```

mod error;

pub use error::ConfigError;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::server::ShellSyntax;
use crate::session::StoragePolicy;
use crate::shutdown::WaitPolicy;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub announce: AnnounceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sums: SumsConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "listener.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.database.path == self.database.status_path
            && self.database.path != Path::new(":memory:")
        {
            return Err(ConfigError::Validation(
                "database.status_path must differ from database.path".to_string(),
            ));
        }
        if self.sums.enabled && self.sums.root.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "sums.root is required when sums.enabled is set".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[listener]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 picks an ephemeral port.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Host name published in the announcement file. Defaults to the
    /// machine's host name.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

impl ListenerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            poll_interval_ms: default_poll_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            advertise_host: None,
        }
    }
}

/// `[announce]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnnounceConfig {
    /// The file is written to `<prefix>.<pid>`.
    #[serde(default = "default_announce_prefix")]
    pub prefix: PathBuf,
    #[serde(default)]
    pub syntax: ShellSyntax,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            prefix: default_announce_prefix(),
            syntax: ShellSyntax::default(),
        }
    }
}

/// `[database]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database holding the shared transaction.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    /// Database holding `drms_session`, written in autocommit mode. Must not
    /// be the same SQLite file as `path`, whose write lock the shared
    /// transaction holds until exit.
    #[serde(default = "default_status_path")]
    pub status_path: PathBuf,
    /// Skip the serializable isolation level for the whole session.
    #[serde(default)]
    pub no_share: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            status_path: default_status_path(),
            no_share: false,
        }
    }
}

/// `[sums]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SumsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub root: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub archive: bool,
    /// Bound on each storage call the exit protocol makes.
    #[serde(default = "default_sums_timeout_ms")]
    pub timeout_ms: u64,
}

impl SumsConfig {
    pub fn policy(&self) -> StoragePolicy {
        StoragePolicy {
            retention_days: self.retention_days,
            archive: self.archive,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SumsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: PathBuf::new(),
            retention_days: default_retention_days(),
            archive: false,
            timeout_ms: default_sums_timeout_ms(),
        }
    }
}

/// `[shutdown]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    #[serde(default)]
    pub wait_for_clients: WaitPolicy,
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,
}

impl ShutdownConfig {
    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            wait_for_clients: WaitPolicy::default(),
            abort_grace_ms: default_abort_grace_ms(),
        }
    }
}

/// `[auth]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub require_key: bool,
    /// Empty allows every user.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_key: true,
            allowed_users: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_announce_prefix() -> PathBuf {
    std::env::temp_dir().join("drms_export")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("drms.db")
}

fn default_status_path() -> PathBuf {
    PathBuf::from("drms_status.db")
}

fn default_retention_days() -> u32 {
    StoragePolicy::default().retention_days
}

fn default_sums_timeout_ms() -> u64 {
    30_000
}

fn default_abort_grace_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

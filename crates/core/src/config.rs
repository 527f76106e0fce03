//! Configuration management
//!
//! This module handles loading, saving, and migrating the bucketfs
//! configuration file. The file is stored in TOML format at
//! ~/.config/bucketfs/config.toml unless a path is given explicitly.
//!
//! PROTECTED FILE: Changes to schema_version require migration support.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current configuration schema version
///
/// IMPORTANT: Bumping this version requires:
/// 1. Adding a migration in `ConfigManager::migrate`
/// 2. Updating migration tests
/// 3. Marking the change as BREAKING
pub const SCHEMA_VERSION: u32 = 1;

/// 1 MiB
pub const MIB: u64 = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Schema version for migration support
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Remote endpoint and credentials
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Buffering and fan-out settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Retry settings for backend calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Timeout settings for backend calls
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Ownership reported for mounted nodes
    #[serde(default)]
    pub mount: MountConfig,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            remote: RemoteConfig::default(),
            transfer: TransferConfig::default(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            mount: MountConfig::default(),
        }
    }
}

impl Config {
    /// Check the values that cannot be expressed through serde defaults
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.remote.endpoint)?;
        if let Some(external) = &self.remote.external_url {
            url::Url::parse(external)?;
        }
        if self.transfer.delete_concurrency == 0 {
            return Err(Error::Config("transfer.delete_concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Remote S3-compatible endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// S3 endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Access key ID
    #[serde(default)]
    pub access_key: String,

    /// Secret access key
    #[serde(default)]
    pub secret_key: String,

    /// Region used for request signing
    #[serde(default = "default_region")]
    pub region: String,

    /// Public URL substituted into share links
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,

    /// Bucket lookup style: "auto", "path", or "dns"
    #[serde(default = "default_bucket_lookup")]
    pub bucket_lookup: String,
}

fn default_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket_lookup() -> String {
    "auto".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            access_key: String::new(),
            secret_key: String::new(),
            region: default_region(),
            external_url: None,
            bucket_lookup: default_bucket_lookup(),
        }
    }
}

/// Buffering and fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Objects larger than this get an asynchronous read-ahead buffer
    #[serde(default = "default_buffer_threshold")]
    pub buffer_threshold: u64,

    /// Total read-ahead budget per open file
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u64,

    /// Maximum in-flight deletes while emptying a bucket
    #[serde(default = "default_delete_concurrency")]
    pub delete_concurrency: usize,

    /// Part size for streaming uploads
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Parts uploaded in parallel by a streaming upload
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    /// Default lifetime of presigned share links, in seconds
    #[serde(default = "default_share_expiry")]
    pub share_expiry_secs: u64,
}

fn default_buffer_threshold() -> u64 {
    16 * MIB
}

fn default_buffer_size() -> u64 {
    16 * MIB
}

fn default_delete_concurrency() -> usize {
    32
}

fn default_part_size() -> u64 {
    16 * MIB
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_share_expiry() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: default_buffer_threshold(),
            buffer_size: default_buffer_size(),
            delete_concurrency: default_delete_concurrency(),
            part_size: default_part_size(),
            upload_concurrency: default_upload_concurrency(),
            share_expiry_secs: default_share_expiry(),
        }
    }
}

impl TransferConfig {
    /// Default share link lifetime
    pub fn share_expiry(&self) -> Duration {
        Duration::from_secs(self.share_expiry_secs)
    }
}

/// Retry configuration for backend calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum cumulative backoff wait in milliseconds
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed_ms: u64,
}

fn default_max_attempts() -> u32 {
    20
}

fn default_base_delay() -> u64 {
    25
}

fn default_max_elapsed() -> u64 {
    20_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_elapsed_ms: default_max_elapsed(),
        }
    }
}

impl RetryConfig {
    /// Base backoff delay
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum cumulative backoff wait
    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }
}

/// Timeout configuration for backend calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,

    /// Read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    30000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout(),
            read_ms: default_read_timeout(),
        }
    }
}

/// Ownership and permission bits reported for mounted nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Owner user id
    #[serde(default)]
    pub uid: u32,

    /// Owner group id
    #[serde(default)]
    pub gid: u32,

    /// Permission bits for directories
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,

    /// Permission bits for files
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

fn default_dir_mode() -> u32 {
    0o755
}

fn default_file_mode() -> u32 {
    0o644
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            dir_mode: default_dir_mode(),
            file_mode: default_file_mode(),
        }
    }
}

/// Configuration manager handles loading and saving config
#[derive(Debug)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the default config path
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".into()))?;
        let config_path = config_dir.join("bucketfs").join("config.toml");
        Ok(Self { config_path })
    }

    /// Create a ConfigManager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Load configuration from disk
    ///
    /// If the configuration file doesn't exist, returns a default configuration.
    /// If the schema version doesn't match, attempts migration.
    pub fn load(&self) -> Result<Config> {
        if !self.config_path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&self.config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        if config.schema_version < SCHEMA_VERSION {
            config = self.migrate(config)?;
        } else if config.schema_version > SCHEMA_VERSION {
            return Err(Error::Config(format!(
                "Configuration file version {} is newer than supported version {}. Please upgrade bucketfs.",
                config.schema_version, SCHEMA_VERSION
            )));
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk
    ///
    /// Creates parent directories if they don't exist.
    /// Sets file permissions to 600 (owner read/write only).
    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(config)?;
        std::fs::write(&self.config_path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.config_path, permissions)?;
        }

        Ok(())
    }

    /// Migrate configuration from older schema version
    fn migrate(&self, config: Config) -> Result<Config> {
        let mut config = config;

        // Schema 0 files predate the version field; their layout is identical.

        config.schema_version = SCHEMA_VERSION;
        Ok(config)
    }
}

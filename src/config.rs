//! Configuration management for blockcryptfs

use crate::crypto::{OVERHEAD, SALT_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default physical block size: one host page
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Largest physical block size accepted
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Default limit for a single read or write request: 16MB
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 16 * 1024 * 1024;

/// Default config file location (tilde expanded by the CLI)
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/blockcryptfs/config.json";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Encryption configuration
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Block I/O configuration
    #[serde(default)]
    pub io: IoConfig,

    /// Mount configuration
    #[serde(default)]
    pub mount: MountConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for key derivation (will be generated if not set)
    #[serde(with = "hex_serde", default)]
    pub salt: Vec<u8>,
}

/// Block I/O configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Physical block size in bytes (nonce + ciphertext + tag)
    pub block_size: usize,

    /// Largest read or write accepted in one request
    pub max_request_size: usize,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter directive (trace, debug, info, warn, error, or a target list)
    pub level: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(), // Will be generated on first use
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fs_name: "blockcryptfs".to_string(),
            allow_other: false,
            allow_root: false,
            auto_unmount: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("BLOCKCRYPTFS_LOG") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }

        if let Ok(limit) = std::env::var("BLOCKCRYPTFS_MAX_REQUEST_SIZE") {
            if let Ok(limit) = limit.trim().parse::<usize>() {
                self.io.max_request_size = limit;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.io.block_size <= OVERHEAD {
            return Err(Error::InvalidConfig(format!(
                "Block size {} must exceed the per-block overhead of {} bytes",
                self.io.block_size, OVERHEAD
            )));
        }

        if self.io.block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Block size {} exceeds the {} byte limit",
                self.io.block_size, MAX_BLOCK_SIZE
            )));
        }

        if self.io.max_request_size == 0 {
            return Err(Error::InvalidConfig(
                "Maximum request size must be greater than 0".to_string(),
            ));
        }

        let enc = &self.encryption;
        if enc.argon2_memory_kib == 0 || enc.argon2_iterations == 0 || enc.argon2_parallelism == 0
        {
            return Err(Error::InvalidConfig(
                "Argon2 parameters must be greater than 0".to_string(),
            ));
        }

        if !enc.salt.is_empty() && enc.salt.len() != SALT_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Salt must be {} bytes, got {}",
                SALT_SIZE,
                enc.salt.len()
            )));
        }

        Ok(())
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

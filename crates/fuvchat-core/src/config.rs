//! Centralized Configuration Management
//!
//! Server and client settings with defaults matching the deployed service,
//! loadable from TOML. Every section is optional in the file; missing fields
//! fall back to their defaults.

use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{ChatError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Public messages retained for history replay
pub const DEFAULT_MAX_HISTORY: usize = 200;

/// Longest accepted display name, in characters
pub const DEFAULT_MAX_USERNAME_LEN: usize = 50;

/// Largest file accepted inline or by chunked transfer (5 MiB)
pub const DEFAULT_MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;

/// Default transfer chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Cap on attachment name and MIME type length
pub const DEFAULT_MAX_ATTACHMENT_NAME_LEN: usize = 255;

/// Private messages whose delivery status is tracked for read receipts
pub const DEFAULT_MAX_TRACKED_MESSAGES: usize = 10_000;

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

/// Server-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum number of public messages kept for replay
    pub max_history: usize,
    /// Maximum display name length
    pub max_username_len: usize,
    /// Maximum file size in bytes, inline or chunked
    pub max_file_bytes: u64,
    /// Maximum attachment name / MIME length
    pub max_attachment_name_len: usize,
    /// Private message records kept for read receipts; the oldest are evicted
    pub max_tracked_messages: usize,
    /// Chunk size used when the relay re-chunks a file
    pub relay_chunk_size: usize,
    /// Pause between relayed chunk emits, in milliseconds
    pub relay_chunk_delay_ms: u64,
    /// Stage reassembled uploads on disk under this directory
    pub upload_dir: Option<PathBuf>,
    /// Drop incomplete transfers idle for longer than this
    pub transfer_idle_timeout_secs: Option<u64>,
    /// RSA modulus size for a generated key pair
    pub rsa_key_bits: usize,
    /// PEM private key to load instead of generating one
    pub private_key_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            max_username_len: DEFAULT_MAX_USERNAME_LEN,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_attachment_name_len: DEFAULT_MAX_ATTACHMENT_NAME_LEN,
            max_tracked_messages: DEFAULT_MAX_TRACKED_MESSAGES,
            relay_chunk_size: DEFAULT_CHUNK_SIZE,
            relay_chunk_delay_ms: 0,
            upload_dir: None,
            transfer_idle_timeout_secs: None,
            rsa_key_bits: 2048,
            private_key_path: None,
        }
    }
}

impl ServerConfig {
    pub fn relay_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.relay_chunk_delay_ms)
    }

    pub fn transfer_idle_timeout(&self) -> Option<Duration> {
        self.transfer_idle_timeout_secs.map(Duration::from_secs)
    }
}

// ----------------------------------------------------------------------------
// Client Configuration
// ----------------------------------------------------------------------------

/// Reconnect backoff policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Wait after the first failed attempt
    pub base_delay_ms: u64,
    /// Upper bound on any single wait
    pub max_delay_ms: u64,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Wait after failed attempt `attempt` (1-based): `min(base * 2^(attempt-1), max)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Client-side settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub reconnect: ReconnectConfig,
    /// Outbound transfer chunk size
    pub chunk_size: usize,
    /// Pause between outbound chunk emits, in milliseconds
    pub chunk_throttle_ms: u64,
    /// Largest file the client will send
    pub max_file_bytes: u64,
    /// Longest display name the client will submit
    pub max_username_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_throttle_ms: 10,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_username_len: DEFAULT_MAX_USERNAME_LEN,
        }
    }
}

impl ClientConfig {
    pub fn chunk_throttle(&self) -> Duration {
        Duration::from_millis(self.chunk_throttle_ms)
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for both tiers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl ChatConfig {
    /// Fast settings for tests: small RSA keys and no throttling
    pub fn testing() -> Self {
        Self {
            server: ServerConfig {
                rsa_key_bits: 1024,
                ..ServerConfig::default()
            },
            client: ClientConfig {
                chunk_throttle_ms: 0,
                ..ClientConfig::default()
            },
        }
    }

    /// Parse from a TOML document and validate
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ChatConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Reject settings the server or client cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.max_history == 0 {
            return Err(ChatError::config_error("server.max_history must be positive"));
        }
        if self.server.max_tracked_messages == 0 {
            return Err(ChatError::config_error(
                "server.max_tracked_messages must be positive",
            ));
        }
        if self.server.max_username_len == 0 {
            return Err(ChatError::config_error(
                "server.max_username_len must be positive",
            ));
        }
        if self.server.relay_chunk_size == 0 || self.client.chunk_size == 0 {
            return Err(ChatError::config_error("chunk sizes must be positive"));
        }
        if self.server.max_file_bytes == 0 || self.client.max_file_bytes == 0 {
            return Err(ChatError::config_error("max_file_bytes must be positive"));
        }
        if self.server.rsa_key_bits < 1024 {
            return Err(ChatError::config_error(
                "server.rsa_key_bits must be at least 1024",
            ));
        }
        let reconnect = &self.client.reconnect;
        if reconnect.max_attempts == 0 {
            return Err(ChatError::config_error(
                "client.reconnect.max_attempts must be positive",
            ));
        }
        if reconnect.base_delay_ms > reconnect.max_delay_ms {
            return Err(ChatError::config_error(
                "client.reconnect.base_delay_ms exceeds max_delay_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = ReconnectConfig::default();
        let waits: Vec<u64> = (1..=7)
            .map(|attempt| policy.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for_attempt(100), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ChatConfig::from_toml_str(
            r#"
            [server]
            max_history = 50

            [client.reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.server.max_history, 50);
        assert_eq!(config.server.max_username_len, DEFAULT_MAX_USERNAME_LEN);
        assert_eq!(config.server.max_tracked_messages, DEFAULT_MAX_TRACKED_MESSAGES);
        assert_eq!(config.client.reconnect.max_attempts, 3);
        assert_eq!(config.client.reconnect.base_delay_ms, 1_000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = ChatConfig::from_toml_str("[client.reconnect]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ChatError::Config { .. }));

        let err = ChatConfig::from_toml_str("[server]\nmax_tracked_messages = 0\n").unwrap_err();
        assert!(matches!(err, ChatError::Config { .. }));

        let err = ChatConfig::from_toml_str("[server]\nmax_history = \"lots\"\n").unwrap_err();
        assert!(matches!(err, ChatError::TomlParsing(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nrelay_chunk_size = 1024").unwrap();
        let config = ChatConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.relay_chunk_size, 1024);
    }
}

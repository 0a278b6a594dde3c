//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Cipher method shared by both endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// AES-256 in CFB mode, key = SHA-256(password), 16-byte IV per direction
    #[serde(rename = "aes-256-cfb")]
    Aes256Cfb,
    /// Legacy byte-permutation table seeded from MD5(password). Not a real
    /// cipher; kept for interoperability and disabled unless `allow_table`
    /// is set.
    #[serde(rename = "table")]
    Table,
}

/// Main configuration: one flat record shared by the local and remote
/// binaries, loaded from a JSON file. Missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote proxy host (local side dials this)
    #[serde(default = "default_server_host")]
    pub server_host: String,
    /// Remote proxy port; the remote side listens here
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// SOCKS5 listen host (local side)
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// SOCKS5 listen port (local side)
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Optional HTTP proxy listen port (local side)
    #[serde(default)]
    pub http_port: Option<u16>,
    /// Pre-shared password
    #[serde(default)]
    pub password: String,
    /// Cipher method
    #[serde(default = "default_method")]
    pub method: Method,
    /// Explicit opt-in for the legacy table cipher
    #[serde(default)]
    pub allow_table: bool,
    /// Idle timeout for an established relay, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_sec: u32,
    /// Bound on dialling and on each negotiation, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u32,
    /// Dial retries towards the remote proxy (local side)
    #[serde(default = "default_retry_times")]
    pub retry_times: u8,
    /// Pause between dial retries, in seconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_sec: u8,
    /// Whether to retry the remote dial at all
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Cap on concurrently live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8388
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    1080
}

fn default_method() -> Method {
    Method::Aes256Cfb
}

fn default_timeout() -> u32 {
    600
}

fn default_connect_timeout() -> u32 {
    30
}

fn default_retry_times() -> u8 {
    3
}

fn default_retry_interval() -> u8 {
    2
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_server_port(),
            local_host: default_local_host(),
            local_port: default_local_port(),
            http_port: None,
            password: String::new(),
            method: default_method(),
            allow_table: false,
            timeout_sec: default_timeout(),
            connect_timeout_sec: default_connect_timeout(),
            retry_times: default_retry_times(),
            retry_interval_sec: default_retry_interval(),
            auto_reconnect: default_true(),
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check the record for values the proxies cannot run with.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.password.is_empty() {
            return Err(crate::Error::Config("password must not be empty".into()));
        }
        if self.method == Method::Table && !self.allow_table {
            return Err(crate::Error::Config(
                "the table method is insecure; set allow_table to use it anyway".into(),
            ));
        }
        if self.timeout_sec == 0 {
            return Err(crate::Error::Config("timeout_sec must be non-zero".into()));
        }
        if self.connect_timeout_sec == 0 {
            return Err(crate::Error::Config(
                "connect_timeout_sec must be non-zero".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(crate::Error::Config(
                "max_connections must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Idle timeout as a Duration
    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.timeout_sec))
    }

    /// Connect/negotiation timeout as a Duration
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.connect_timeout_sec))
    }
}

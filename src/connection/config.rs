//! Connection configuration module
//!
//! This module holds the wire-level contract for establishing a transport:
//! target address, credentials, timeouts, host key policy and privilege
//! escalation settings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::{ConnectionError, ConnectionResult};

/// Default command timeout in seconds
pub const DEFAULT_TIMEOUT: u64 = 30;

/// Default connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default WinRM HTTP port
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Configuration for a single connection to one host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Target hostname or IP address
    pub host: String,

    /// Port (0 means the transport default)
    pub port: u16,

    /// Remote user
    pub user: Option<String>,

    /// Password for password authentication
    pub password: Option<String>,

    /// Inline private key material (PEM / OpenSSH format)
    pub private_key: Option<String>,

    /// Path to a private key file
    pub private_key_file: Option<String>,

    /// Passphrase for an encrypted private key
    pub passphrase: Option<String>,

    /// Command timeout in seconds
    pub timeout: u64,

    /// Connect timeout in seconds
    pub connect_timeout: u64,

    /// Verify the remote host key against known_hosts
    pub host_key_checking: bool,

    /// Enable privilege escalation
    #[serde(rename = "become")]
    pub r#become: bool,

    /// Escalation method (sudo, su, doas, ...)
    pub become_method: Option<String>,

    /// User to become
    pub become_user: Option<String>,

    /// Password for the escalation method
    pub become_password: Option<String>,

    /// Environment variables exported for every command
    pub environment: HashMap<String, String>,

    /// Transport-specific options
    pub extra: HashMap<String, serde_json::Value>,
}

impl ConnectionConfig {
    /// Create a configuration for a host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Fill in defaults and reject unusable settings
    pub fn validate(&mut self) -> ConnectionResult<()> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::InvalidConfig(
                "host must not be empty".to_string(),
            ));
        }
        if self.timeout == 0 {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.connect_timeout == 0 {
            self.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        }
        Ok(())
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the remote user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the private key file path
    pub fn with_private_key_file(mut self, path: impl Into<String>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    /// Enable privilege escalation with the given method and user
    pub fn with_become(mut self, method: impl Into<String>, user: Option<String>) -> Self {
        self.r#become = true;
        self.become_method = Some(method.into());
        self.become_user = user;
        self
    }

    /// Enable or disable host key checking
    pub fn with_host_key_checking(mut self, enabled: bool) -> Self {
        self.host_key_checking = enabled;
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Add a transport-specific option
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// The configured port, or `default` when unset
    pub fn port_or(&self, default: u16) -> u16 {
        if self.port == 0 {
            default
        } else {
            self.port
        }
    }

    /// The remote user, falling back to the local user name
    pub fn user_or_current(&self) -> String {
        self.user.clone().unwrap_or_else(current_user)
    }

    /// Command timeout as a duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(if self.timeout == 0 {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        })
    }

    /// Connect timeout as a duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(if self.connect_timeout == 0 {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            self.connect_timeout
        })
    }

    /// Look up a string option in `extra`
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Look up a boolean option in `extra`, accepting "yes"/"no" strings
    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        match self.extra.get(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Some(true),
                "false" | "no" | "0" | "off" | "ignore" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or_else(|_| path.into());
    PathBuf::from(expanded.as_ref())
}

/// Default identity files to try, in order, that exist on disk
pub fn default_identity_files() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    let ssh_dir = home.join(".ssh");

    vec![
        ssh_dir.join("id_rsa"),
        ssh_dir.join("id_ecdsa"),
        ssh_dir.join("id_ed25519"),
    ]
    .into_iter()
    .filter(|p| p.exists())
    .collect()
}

/// Default known_hosts location
pub fn default_known_hosts_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join(".ssh")
        .join("known_hosts")
}

/// Get the current username
pub(crate) fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

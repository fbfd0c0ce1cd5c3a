//! Configuration module for Convoy
//!
//! Handles loading and merging configuration from multiple sources:
//! - Default values
//! - System configuration (/etc/convoy/convoy.toml)
//! - User configuration (~/.convoy.toml)
//! - Project configuration (./convoy.toml)
//! - Environment variables (`CONVOY_*`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::connection::ConnectionConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default settings
    pub defaults: Defaults,

    /// Privilege escalation settings
    pub privilege_escalation: PrivilegeEscalation,

    /// SSH settings
    pub ssh: SshConfig,

    /// WinRM settings
    pub winrm: WinRmConfig,

    /// Routing table loaded at startup
    pub routing_file: Option<PathBuf>,

    /// Environment variables exported to every command
    pub environment: HashMap<String, String>,
}

/// Default configuration values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Number of workers in the pool
    pub forks: usize,

    /// Capacity of the task queue
    pub queue_capacity: usize,

    /// Command timeout in seconds
    pub timeout: u64,

    /// Connect timeout in seconds
    pub connect_timeout: u64,

    /// Default transport ("smart", "local", "ssh", "winrm")
    pub transport: String,

    /// Default remote user
    pub remote_user: Option<String>,

    /// Seconds between retry attempts when a task sets none
    pub retry_delay: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            forks: 5,
            queue_capacity: 100,
            timeout: 30,
            connect_timeout: 10,
            transport: "smart".to_string(),
            remote_user: None,
            retry_delay: 1,
        }
    }
}

/// Privilege escalation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegeEscalation {
    /// Enable become by default
    pub r#become: bool,

    /// Default become method
    pub become_method: String,

    /// Default become user
    pub become_user: String,
}

impl Default for PrivilegeEscalation {
    fn default() -> Self {
        Self {
            r#become: false,
            become_method: "sudo".to_string(),
            become_user: "root".to_string(),
        }
    }
}

/// SSH configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Verify host keys against the known hosts file
    pub host_key_checking: bool,

    /// Known hosts file
    pub known_hosts_file: Option<PathBuf>,

    /// Private key file
    pub private_key_file: Option<PathBuf>,

    /// Port used when the host sets none
    pub port: Option<u16>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host_key_checking: true,
            known_hosts_file: None,
            private_key_file: None,
            port: None,
        }
    }
}

/// WinRM configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WinRmConfig {
    /// Use HTTPS
    pub use_ssl: bool,

    /// Verify the server certificate over HTTPS
    pub cert_validation: bool,
}

impl Default for WinRmConfig {
    fn default() -> Self {
        Self {
            use_ssl: false,
            cert_validation: true,
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut merged = toml::Table::new();

        for path in Self::get_config_paths(config_path) {
            if path.exists() {
                let table = Self::read_table(&path)?;
                merge_tables(&mut merged, table);
            }
        }

        let mut config: Config = toml::Value::Table(merged)
            .try_into()
            .context("Invalid configuration")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a specific file, without environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let table = Self::read_table(path.as_ref())?;
        toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid configuration in {}", path.as_ref().display()))
    }

    /// Get the list of configuration file paths to check, lowest precedence first
    fn get_config_paths(explicit_path: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit_path {
            return vec![path.to_path_buf()];
        }

        if let Ok(env_config) = std::env::var("CONVOY_CONFIG") {
            return vec![PathBuf::from(env_config)];
        }

        let mut paths = vec![PathBuf::from("/etc/convoy/convoy.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".convoy.toml"));
        }
        paths.push(PathBuf::from("convoy.toml"));
        paths
    }

    fn read_table(path: &Path) -> Result<toml::Table> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(n) = parsed("CONVOY_FORKS") {
            self.defaults.forks = n;
        }
        if let Some(n) = parsed("CONVOY_TIMEOUT") {
            self.defaults.timeout = n;
        }
        if let Some(n) = parsed("CONVOY_RETRY_DELAY") {
            self.defaults.retry_delay = n;
        }
        if let Ok(transport) = std::env::var("CONVOY_TRANSPORT") {
            self.defaults.transport = transport;
        }
        if let Ok(user) = std::env::var("CONVOY_REMOTE_USER") {
            self.defaults.remote_user = Some(user);
        }
        if let Some(enabled) = std::env::var("CONVOY_BECOME").ok().map(|v| truthy(&v)) {
            self.privilege_escalation.r#become = enabled;
        }
        if let Ok(method) = std::env::var("CONVOY_BECOME_METHOD") {
            self.privilege_escalation.become_method = method;
        }
        if let Ok(user) = std::env::var("CONVOY_BECOME_USER") {
            self.privilege_escalation.become_user = user;
        }
        if let Some(check) = std::env::var("CONVOY_HOST_KEY_CHECKING").ok().map(|v| truthy(&v)) {
            self.ssh.host_key_checking = check;
        }
        if let Ok(file) = std::env::var("CONVOY_PRIVATE_KEY_FILE") {
            self.ssh.private_key_file = Some(PathBuf::from(file));
        }
        if let Ok(file) = std::env::var("CONVOY_ROUTING_FILE") {
            self.routing_file = Some(PathBuf::from(file));
        }
    }

    /// Connection settings for `host` derived from these defaults
    pub fn connection_config(&self, host: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(host);
        config.timeout = self.defaults.timeout;
        config.connect_timeout = self.defaults.connect_timeout;
        config.user = self.defaults.remote_user.clone();
        config.host_key_checking = self.ssh.host_key_checking;
        config.port = self.ssh.port.unwrap_or(0);
        config.private_key_file = self
            .ssh
            .private_key_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        config.environment = self.environment.clone();
        if let Some(known_hosts) = &self.ssh.known_hosts_file {
            config = config.with_extra(
                "known_hosts_file",
                known_hosts.to_string_lossy().into_owned().into(),
            );
        }
        config = config
            .with_extra("use_ssl", self.winrm.use_ssl.into())
            .with_extra("cert_validation", self.winrm.cert_validation.into());
        if self.privilege_escalation.r#become {
            config = config.with_become(
                self.privilege_escalation.become_method.clone(),
                Some(self.privilege_escalation.become_user.clone()),
            );
        }
        config
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Merge `other` into `base`; nested tables merge, other values replace
fn merge_tables(base: &mut toml::Table, other: toml::Table) {
    for (key, value) in other {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.defaults.forks, 5);
        assert_eq!(config.defaults.timeout, 30);
        assert_eq!(config.defaults.transport, "smart");
        assert!(!config.privilege_escalation.r#become);
        assert!(config.ssh.host_key_checking);
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base: toml::Table = toml::from_str(
            "[defaults]\nforks = 10\ntimeout = 60\n[ssh]\nport = 2222\n",
        )
        .unwrap();
        let other: toml::Table = toml::from_str("[defaults]\nforks = 20\n").unwrap();
        merge_tables(&mut base, other);

        let config: Config = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.defaults.forks, 20);
        assert_eq!(config.defaults.timeout, 60);
        assert_eq!(config.ssh.port, Some(2222));
    }

    #[test]
    #[serial]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convoy.toml");
        std::fs::write(
            &path,
            "routing_file = \"routing.yml\"\n[privilege_escalation]\nbecome = true\nbecome_user = \"admin\"\n",
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert!(config.privilege_escalation.r#become);
        assert_eq!(config.privilege_escalation.become_user, "admin");
        assert_eq!(config.privilege_escalation.become_method, "sudo");
        assert_eq!(config.routing_file, Some(PathBuf::from("routing.yml")));
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "defaults = [").unwrap();
        assert!(Config::from_file(&path).is_err());
        assert!(Config::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("CONVOY_FORKS", "20");
        std::env::set_var("CONVOY_BECOME", "yes");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("CONVOY_FORKS");
        std::env::remove_var("CONVOY_BECOME");

        assert_eq!(config.defaults.forks, 20);
        assert!(config.privilege_escalation.r#become);
    }

    #[test]
    fn test_connection_config_from_defaults() {
        let mut config = Config::default();
        config.defaults.remote_user = Some("deploy".into());
        config.privilege_escalation.r#become = true;
        config.ssh.host_key_checking = false;

        let conn = config.connection_config("web1");
        assert_eq!(conn.host, "web1");
        assert_eq!(conn.user.as_deref(), Some("deploy"));
        assert_eq!(conn.timeout, 30);
        assert!(!conn.host_key_checking);
        assert!(conn.r#become);
        assert_eq!(conn.become_user.as_deref(), Some("root"));
    }
}

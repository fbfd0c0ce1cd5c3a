//! Connection layer for remote host communication.
//!
//! This module provides a unified interface for executing commands and transferring
//! files across different transport mechanisms (local shell, SSH, WinRM).
//!
//! # Overview
//!
//! The connection layer abstracts the transport so that modules don't need to
//! know whether they're running locally, over SSH, or against a Windows host.
//! All transports implement the [`Connection`] trait and share a
//! [`BaseConnection`] that tracks the connected flag and rewrites commands for
//! privilege escalation.
//!
//! # Connection Management
//!
//! Connections are created by name through the [`ConnectionFactory`] and cached
//! per `(host, transport)` pair by the [`ConnectionManager`].
//!
//! # Example
//!
//! ```rust,ignore
//! use convoy::connection::{ConnectionConfig, ConnectionManager};
//!
//! let manager = ConnectionManager::new();
//! let config = ConnectionConfig::new("192.168.1.100").with_user("admin");
//! let conn = manager.get_connection("192.168.1.100", "ssh", config).await?;
//!
//! let result = conn.execute("uname -a", None).await?;
//! println!("Output: {}", result.stdout);
//! ```

/// Privilege escalation shared by every transport.
pub mod base;

/// Connection configuration types.
pub mod config;

/// Local execution connection implementation.
pub mod local;

/// Cache of live connections keyed by host and transport.
pub mod manager;

/// Pure Rust SSH implementation using russh.
#[cfg(feature = "russh")]
pub mod ssh;

/// Windows Remote Management connection implementation.
pub mod winrm;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use base::{BaseConnection, BecomeMethod};
pub use config::ConnectionConfig;
pub use local::LocalConnection;
pub use manager::ConnectionManager;
#[cfg(feature = "russh")]
pub use ssh::SshConnection;
pub use winrm::WinRmConnection;

/// Errors that can occur during connection operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish initial connection to the host.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote host key could not be verified.
    #[error("Host key verification failed: {0}")]
    HostKeyVerification(String),

    /// Command execution failed (not to be confused with non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// File upload or download operation failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// A data-plane operation was attempted on a disconnected handle.
    #[error("Not connected")]
    NotConnected,

    /// Configuration is invalid or incomplete.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested transport is not known to the factory.
    #[error("Unknown connection type: {0}")]
    UnknownType(String),

    /// SSH-specific error from the underlying implementation.
    #[error("SSH error: {0}")]
    SshError(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The requested operation is not supported by this transport.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// An error annotated with the host and transport it came from.
    #[error("{transport} connection to '{host}': {source}")]
    Transport {
        /// Target host
        host: String,
        /// Transport name
        transport: String,
        /// Underlying error
        #[source]
        source: Box<ConnectionError>,
    },
}

impl ConnectionError {
    /// Wrap this error with the host and transport it came from.
    ///
    /// Already-wrapped errors are returned unchanged.
    pub fn in_transport(self, host: &str, transport: &str) -> Self {
        match self {
            wrapped @ ConnectionError::Transport { .. } => wrapped,
            other => ConnectionError::Transport {
                host: host.to_string(),
                transport: transport.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Whether this error (or the error it wraps) is a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            ConnectionError::Timeout(_) => true,
            ConnectionError::Transport { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(feature = "russh")]
impl From<::russh::Error> for ConnectionError {
    fn from(err: ::russh::Error) -> Self {
        ConnectionError::SshError(err.to_string())
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// The result of executing a command on a connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit code of the command (0 typically indicates success).
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Wall-clock time spent running the command.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl CommandResult {
    /// Create a new command result
    pub fn new(exit_code: i32, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            duration,
        }
    }

    /// `true` if the exit code is zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get the combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// File metadata reported by [`Connection::get_file_info`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File size in bytes
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    /// Last modification time (Unix timestamp)
    pub mtime: i64,
    /// Is this a directory?
    pub is_dir: bool,
    /// Owner name
    pub owner: String,
    /// Group name
    pub group: String,
}

/// The main connection trait that all transport implementations must implement.
///
/// Data-plane operations return [`ConnectionError::NotConnected`] unless
/// [`Connection::connect`] has succeeded. Dropping a returned future cancels
/// the operation.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Shared connection state
    fn base(&self) -> &BaseConnection;

    /// Transport name ("local", "ssh", "winrm", ...)
    fn connection_type(&self) -> &str;

    /// Target host
    fn host(&self) -> &str {
        &self.base().config().host
    }

    /// Whether the connection is currently established
    fn is_connected(&self) -> bool {
        self.base().is_connected()
    }

    /// Rewrite a command for privilege escalation
    fn apply_become(&self, command: &str) -> String {
        self.base().apply_become(command)
    }

    /// Establish the connection
    async fn connect(&self) -> ConnectionResult<()>;

    /// Close the connection
    async fn close(&self) -> ConnectionResult<()>;

    /// Execute a command, optionally feeding `stdin`
    async fn execute(&self, command: &str, stdin: Option<&[u8]>)
        -> ConnectionResult<CommandResult>;

    /// Copy a local file to the target
    async fn put_file(&self, local_path: &Path, remote_path: &Path) -> ConnectionResult<()>;

    /// Copy a file from the target to the local filesystem
    async fn get_file(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()>;

    /// Check if a path exists on the target
    async fn file_exists(&self, path: &Path) -> ConnectionResult<bool>;

    /// Create a directory (and parents) with the given mode
    async fn create_directory(&self, path: &Path, mode: u32) -> ConnectionResult<()>;

    /// Remove a file
    async fn remove_file(&self, path: &Path) -> ConnectionResult<()>;

    /// Get file metadata
    async fn get_file_info(&self, path: &Path) -> ConnectionResult<FileInfo>;
}

/// Built-in transport types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Local connection (no network)
    Local,
    /// SSH connection to remote host
    Ssh,
    /// Windows Remote Management
    #[serde(rename = "winrm")]
    WinRm,
}

impl ConnectionType {
    /// Canonical transport name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Local => "local",
            ConnectionType::Ssh => "ssh",
            ConnectionType::WinRm => "winrm",
        }
    }

    /// Pick local or SSH for the `smart` pseudo-type
    pub fn smart(host: &str) -> Self {
        match host {
            "" | "localhost" | "127.0.0.1" => ConnectionType::Local,
            _ => ConnectionType::Ssh,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ConnectionType::Local),
            "ssh" | "paramiko" | "russh" => Ok(ConnectionType::Ssh),
            "winrm" => Ok(ConnectionType::WinRm),
            other => Err(ConnectionError::UnknownType(other.to_string())),
        }
    }
}

/// Constructor for a transport registered at runtime
pub type TransportConstructor =
    Arc<dyn Fn(ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> + Send + Sync>;

/// Factory for creating (not yet connected) connections by type name
#[derive(Default)]
pub struct ConnectionFactory {
    custom: RwLock<HashMap<String, TransportConstructor>>,
}

impl ConnectionFactory {
    /// Create a factory knowing only the built-in transports
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a transport constructor under `name`
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(ConnectionConfig) -> ConnectionResult<Arc<dyn Connection>> + Send + Sync + 'static,
    {
        self.custom
            .write()
            .insert(name.into().to_lowercase(), Arc::new(constructor));
    }

    /// Normalize a requested type name, resolving `smart` against the host
    pub fn resolve_type(&self, type_name: &str, host: &str) -> String {
        let name = type_name.trim().to_lowercase();
        match name.as_str() {
            "" | "smart" => ConnectionType::smart(host).as_str().to_string(),
            _ => name,
        }
    }

    /// Create a connection for `type_name`
    pub fn create(
        &self,
        type_name: &str,
        mut config: ConnectionConfig,
    ) -> ConnectionResult<Arc<dyn Connection>> {
        let name = self.resolve_type(type_name, &config.host);

        if let Some(constructor) = self.custom.read().get(&name).cloned() {
            return constructor(config);
        }

        match name.parse::<ConnectionType>()? {
            ConnectionType::Local => {
                if config.host.is_empty() {
                    config.host = "localhost".to_string();
                }
                config.validate()?;
                Ok(Arc::new(LocalConnection::new(config)))
            }
            ConnectionType::Ssh => {
                config.validate()?;
                #[cfg(feature = "russh")]
                {
                    Ok(Arc::new(SshConnection::new(config)))
                }
                #[cfg(not(feature = "russh"))]
                {
                    Err(ConnectionError::InvalidConfig(
                        "No SSH backend available. Enable the 'russh' feature.".to_string(),
                    ))
                }
            }
            ConnectionType::WinRm => {
                config.validate()?;
                Ok(Arc::new(WinRmConnection::new(config)?))
            }
        }
    }
}

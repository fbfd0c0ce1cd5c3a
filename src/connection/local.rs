//! Local connection module
//!
//! This module provides local command execution and file operations
//! without any network transport.

use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, trace};

use super::{
    BaseConnection, CommandResult, Connection, ConnectionConfig, ConnectionError,
    ConnectionResult, FileInfo,
};

/// Local connection for executing commands on the current host
#[derive(Debug)]
pub struct LocalConnection {
    base: BaseConnection,
}

impl LocalConnection {
    /// Create a new local connection
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            base: BaseConnection::new(config),
        }
    }

    /// Create a local connection for `localhost` with default settings
    pub fn localhost() -> Self {
        Self::new(ConnectionConfig::new("localhost"))
    }

    fn build_command(&self, command: &str) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(command);
            c
        };

        for (key, value) in &self.base.config().environment {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd
    }

    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> ConnectionResult<CommandResult> {
        let start = Instant::now();
        let mut child = self.build_command(command).spawn().map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
        })?;

        let mut child_stdin = child.stdin.take();
        let mut child_stdout = child.stdout.take();
        let mut child_stderr = child.stderr.take();

        let feed = async {
            if let Some(mut pipe) = child_stdin.take() {
                if let Some(data) = stdin {
                    pipe.write_all(data).await?;
                }
                pipe.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(pipe) = child_stdout.as_mut() {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(pipe) = child_stderr.as_mut() {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };

        let (fed, stdout, stderr) = tokio::join!(feed, read_stdout, read_stderr);
        // A command that ignores stdin may close the pipe early.
        if let Err(e) = fed {
            if e.kind() != ErrorKind::BrokenPipe {
                return Err(ConnectionError::ExecutionFailed(format!(
                    "Failed to write stdin: {}",
                    e
                )));
            }
        }
        let stdout = stdout?;
        let stderr = stderr?;

        let status = child.wait().await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
        })?;

        let exit_code = status.code().unwrap_or(-1);
        trace!(exit_code = %exit_code, stdout_len = %stdout.len(), stderr_len = %stderr.len(), "Command completed");

        Ok(CommandResult::new(
            exit_code,
            String::from_utf8_lossy(&stdout).to_string(),
            String::from_utf8_lossy(&stderr).to_string(),
            start.elapsed(),
        ))
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn base(&self) -> &BaseConnection {
        &self.base
    }

    fn connection_type(&self) -> &str {
        "local"
    }

    async fn connect(&self) -> ConnectionResult<()> {
        self.base.set_connected(true);
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.base.set_connected(false);
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> ConnectionResult<CommandResult> {
        self.base.ensure_connected()?;

        let command = self.apply_become(command);
        debug!(command = %command, "Executing local command");

        let timeout = self.base.config().timeout_duration();
        match tokio::time::timeout(timeout, self.run(&command, stdin)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(timeout.as_secs())),
        }
    }

    async fn put_file(&self, local_path: &Path, remote_path: &Path) -> ConnectionResult<()> {
        self.base.ensure_connected()?;
        debug!(src = %local_path.display(), dst = %remote_path.display(), "Copying file locally");

        if let Some(parent) = remote_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ConnectionError::TransferFailed(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        fs::copy(local_path, remote_path).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to copy {} to {}: {}",
                local_path.display(),
                remote_path.display(),
                e
            ))
        })?;
        Ok(())
    }

    async fn get_file(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()> {
        // Symmetric with put_file on the local host.
        self.put_file(remote_path, local_path).await
    }

    async fn file_exists(&self, path: &Path) -> ConnectionResult<bool> {
        self.base.ensure_connected()?;
        Ok(path.exists())
    }

    async fn create_directory(&self, path: &Path, mode: u32) -> ConnectionResult<()> {
        self.base.ensure_connected()?;
        debug!(path = %path.display(), mode = %format!("{:o}", mode), "Creating local directory");

        fs::create_dir_all(path)?;
        set_mode(path, mode)
    }

    async fn remove_file(&self, path: &Path) -> ConnectionResult<()> {
        self.base.ensure_connected()?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_file_info(&self, path: &Path) -> ConnectionResult<FileInfo> {
        self.base.ensure_connected()?;
        let metadata = fs::metadata(path).map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to stat {}: {}", path.display(), e))
        })?;
        Ok(file_info(&metadata))
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> ConnectionResult<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        ConnectionError::ExecutionFailed(format!(
            "Failed to set permissions on {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> ConnectionResult<()> {
    Ok(())
}

#[cfg(unix)]
fn file_info(metadata: &fs::Metadata) -> FileInfo {
    use nix::unistd::{Gid, Group, Uid, User};
    use std::os::unix::fs::MetadataExt;

    let owner = User::from_uid(Uid::from_raw(metadata.uid()))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| metadata.uid().to_string());
    let group = Group::from_gid(Gid::from_raw(metadata.gid()))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| metadata.gid().to_string());

    FileInfo {
        size: metadata.len(),
        mode: metadata.mode() & 0o7777,
        mtime: metadata.mtime(),
        is_dir: metadata.is_dir(),
        owner,
        group,
    }
}

#[cfg(not(unix))]
fn file_info(metadata: &fs::Metadata) -> FileInfo {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();

    FileInfo {
        size: metadata.len(),
        mode: if metadata.permissions().readonly() { 0o444 } else { 0o644 },
        mtime,
        is_dir: metadata.is_dir(),
        owner: String::new(),
        group: String::new(),
    }
}

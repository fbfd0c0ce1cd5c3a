//! SSH connection module
//!
//! This module provides SSH connectivity using the russh crate. File
//! operations are plain shell commands over exec channels, so no SFTP
//! subsystem is required on the remote side.

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::{decode_secret_key, load_secret_key};
use russh::ChannelMsg;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use super::base::shell_quote;
use super::config::{
    default_identity_files, default_known_hosts_file, expand_path, DEFAULT_SSH_PORT,
};
use super::{
    BaseConnection, CommandResult, Connection, ConnectionConfig, ConnectionError,
    ConnectionResult, FileInfo,
};

/// Wraps russh::Error for the Handler trait
#[derive(Debug)]
pub struct RusshError(pub ::russh::Error);

impl From<::russh::Error> for RusshError {
    fn from(err: ::russh::Error) -> Self {
        RusshError(err)
    }
}

impl std::fmt::Display for RusshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Russh error: {}", self.0)
    }
}

impl std::error::Error for RusshError {}

/// Format string for `stat -c`, split on `|`
const STAT_FORMAT: &str = "%s|%a|%Y|%F|%U|%G";

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
enum HostKeyStatus {
    Verified,
    Unknown,
    Mismatch,
}

/// A parsed entry from a known_hosts file
#[derive(Debug, Clone)]
struct KnownHostEntry {
    patterns: Vec<String>,
    key: PublicKey,
}

/// Client handler for russh with host key verification
struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Vec<KnownHostEntry>,
    check_host_key: bool,
    /// Set when the server key is rejected, so connect can report why
    rejection: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    fn new(
        host: &str,
        port: u16,
        check_host_key: bool,
        known_hosts_file: &Path,
        rejection: Arc<Mutex<Option<String>>>,
    ) -> Self {
        let known_hosts = if check_host_key {
            load_known_hosts(known_hosts_file)
        } else {
            Vec::new()
        };
        Self {
            host: host.to_string(),
            port,
            known_hosts,
            check_host_key,
            rejection,
        }
    }

    fn verify_host_key(&self, server_key: &PublicKey) -> HostKeyStatus {
        for entry in &self.known_hosts {
            if entry
                .patterns
                .iter()
                .any(|p| pattern_matches(p, &self.host, self.port))
            {
                if entry.key.fingerprint() == server_key.fingerprint() {
                    return HostKeyStatus::Verified;
                }
                return HostKeyStatus::Mismatch;
            }
        }
        HostKeyStatus::Unknown
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.check_host_key {
            warn!(
                host = %self.host,
                fingerprint = %server_public_key.fingerprint(),
                "Host key checking disabled, accepting server key"
            );
            return Ok(true);
        }

        match self.verify_host_key(server_public_key) {
            HostKeyStatus::Verified => {
                debug!(host = %self.host, "Host key verified against known_hosts");
                Ok(true)
            }
            HostKeyStatus::Unknown => {
                warn!(host = %self.host, "Host not found in known_hosts, rejecting");
                *self.rejection.lock() = Some(format!(
                    "no known_hosts entry for {}:{}",
                    self.host, self.port
                ));
                Ok(false)
            }
            HostKeyStatus::Mismatch => {
                warn!(
                    host = %self.host,
                    "HOST KEY VERIFICATION FAILED! Server key does not match known_hosts entry."
                );
                *self.rejection.lock() = Some(format!(
                    "server key for {}:{} does not match known_hosts",
                    self.host, self.port
                ));
                Ok(false)
            }
        }
    }
}

/// Load and parse a known_hosts file; unreadable files yield no entries
fn load_known_hosts(path: &Path) -> Vec<KnownHostEntry> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to read known_hosts file");
            return Vec::new();
        }
    };

    let entries: Vec<KnownHostEntry> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_known_hosts_line)
        .collect();

    debug!(entry_count = %entries.len(), "Loaded known_hosts entries");
    entries
}

/// Parse `hostname[,hostname...] keytype base64key [comment]`
fn parse_known_hosts_line(line: &str) -> Option<KnownHostEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }

    let patterns = parts[0].split(',').map(String::from).collect();
    let key_bytes =
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, parts[2]).ok()?;
    match russh::keys::key::parse_public_key(&key_bytes, None) {
        Ok(key) => Some(KnownHostEntry { patterns, key }),
        Err(_) => {
            trace!(key_type = %parts[1], "Failed to parse key, skipping entry");
            None
        }
    }
}

/// Check whether a known_hosts pattern applies to `host:port`
fn pattern_matches(pattern: &str, host: &str, port: u16) -> bool {
    if let Some(rest) = pattern.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let pattern_port = rest
                .get(end + 2..)
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(DEFAULT_SSH_PORT);
            return &rest[..end] == host && pattern_port == port;
        }
    }

    if port != DEFAULT_SSH_PORT {
        return false;
    }
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(pattern, host);
    }
    pattern == host
}

/// `*` and `?` matching for known_hosts patterns
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    fn go(p: &[char], t: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('*') => (0..=t.len()).any(|i| go(&p[1..], &t[i..])),
            Some('?') => !t.is_empty() && go(&p[1..], &t[1..]),
            Some(c) => t.first() == Some(c) && go(&p[1..], &t[1..]),
        }
    }

    go(&p, &t)
}

/// Parse the output of `stat -c STAT_FORMAT`
fn parse_stat_output(output: &str) -> ConnectionResult<FileInfo> {
    let fields: Vec<&str> = output.trim().splitn(6, '|').collect();
    if fields.len() != 6 {
        return Err(ConnectionError::ExecutionFailed(format!(
            "Unexpected stat output: {}",
            output.trim()
        )));
    }

    let parse_err =
        |what: &str| ConnectionError::ExecutionFailed(format!("Invalid {} in stat output", what));

    Ok(FileInfo {
        size: fields[0].parse().map_err(|_| parse_err("size"))?,
        mode: u32::from_str_radix(fields[1], 8).map_err(|_| parse_err("mode"))?,
        mtime: fields[2].parse().map_err(|_| parse_err("mtime"))?,
        is_dir: fields[3] == "directory",
        owner: fields[4].to_string(),
        group: fields[5].to_string(),
    })
}

/// Raw output of a remote command
struct RawOutput {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// SSH connection backed by a russh client handle
pub struct SshConnection {
    base: BaseConnection,
    handle: RwLock<Option<Handle<ClientHandler>>>,
}

impl SshConnection {
    /// Create a disconnected SSH connection
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            base: BaseConnection::new(config),
            handle: RwLock::new(None),
        }
    }

    fn port(&self) -> u16 {
        self.base.config().port_or(DEFAULT_SSH_PORT)
    }

    fn known_hosts_file(&self) -> PathBuf {
        self.base
            .config()
            .extra_str("known_hosts_file")
            .map(expand_path)
            .unwrap_or_else(default_known_hosts_file)
    }

    async fn do_connect(&self) -> ConnectionResult<Handle<ClientHandler>> {
        let config = self.base.config();
        let host = config.host.as_str();
        let port = self.port();
        let connect_timeout = config.connect_timeout_duration();

        let mut client_config = russh::client::Config::default();
        client_config.inactivity_timeout = Some(config.timeout_duration().max(connect_timeout));
        let client_config = Arc::new(client_config);

        let addr = format!("{}:{}", host, port);
        let socket = tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Timeout(connect_timeout.as_secs()))?
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
            })?;
        socket.set_nodelay(true).ok();

        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler::new(
            host,
            port,
            config.host_key_checking,
            &self.known_hosts_file(),
            rejection.clone(),
        );

        let handshake = russh::client::connect_stream(client_config, socket, handler);
        let mut session = match tokio::time::timeout(connect_timeout, handshake).await {
            Err(_) => return Err(ConnectionError::Timeout(connect_timeout.as_secs())),
            Ok(Err(e)) => {
                if let Some(reason) = rejection.lock().take() {
                    return Err(ConnectionError::HostKeyVerification(reason));
                }
                return Err(ConnectionError::ConnectionFailed(format!(
                    "SSH handshake failed: {}",
                    e
                )));
            }
            Ok(Ok(session)) => session,
        };

        self.authenticate(&mut session).await?;
        debug!(host = %host, port = %port, "SSH connection established");
        Ok(session)
    }

    /// Try password, then the configured key, then default identity files
    async fn authenticate(&self, session: &mut Handle<ClientHandler>) -> ConnectionResult<()> {
        let config = self.base.config();
        let user = config.user_or_current();

        if let Some(password) = &config.password {
            let authenticated = session
                .authenticate_password(&user, password)
                .await
                .map_err(|e| {
                    ConnectionError::AuthenticationFailed(format!(
                        "Password authentication failed: {}",
                        e
                    ))
                })?;
            if authenticated {
                debug!("Authenticated using password");
                return Ok(());
            }
        }

        let passphrase = config.passphrase.as_deref();

        if let Some(key_data) = &config.private_key {
            let key_pair = decode_secret_key(key_data, passphrase).map_err(|e| {
                ConnectionError::AuthenticationFailed(format!("Failed to decode private key: {}", e))
            })?;
            if try_key(session, &user, key_pair).await? {
                debug!("Authenticated using inline key");
                return Ok(());
            }
        }

        if let Some(key_file) = &config.private_key_file {
            let key_path = expand_path(key_file);
            let key_pair = load_secret_key(&key_path, passphrase).map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "Failed to load key {}: {}",
                    key_path.display(),
                    e
                ))
            })?;
            if try_key(session, &user, key_pair).await? {
                debug!(key = %key_path.display(), "Authenticated using key");
                return Ok(());
            }
        }

        for key_path in default_identity_files() {
            let key_pair = match load_secret_key(&key_path, passphrase) {
                Ok(k) => k,
                Err(e) => {
                    trace!(key = %key_path.display(), error = %e, "Skipping identity file");
                    continue;
                }
            };
            if try_key(session, &user, key_pair).await? {
                debug!(key = %key_path.display(), "Authenticated using key");
                return Ok(());
            }
        }

        Err(ConnectionError::AuthenticationFailed(format!(
            "All authentication methods failed for user '{}'",
            user
        )))
    }

    /// Prefix environment exports onto `command`
    fn with_environment(&self, command: String) -> String {
        let env = &self.base.config().environment;
        if env.is_empty() {
            return command;
        }
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        let exports: Vec<String> = keys
            .into_iter()
            .map(|k| format!("export {}={};", k, shell_quote(&env[k])))
            .collect();
        format!("{} {}", exports.join(" "), command)
    }

    /// The command line sent to the remote shell; exports run inside the escalated shell
    fn remote_command(&self, command: &str) -> String {
        self.apply_become(&self.with_environment(command.to_string()))
    }

    async fn run_raw(&self, command: &str, stdin: Option<&[u8]>) -> ConnectionResult<RawOutput> {
        self.base.ensure_connected()?;

        let full_command = self.remote_command(command);
        trace!(command = %full_command, "Executing remote command");

        let run = async {
            let mut channel = {
                let guard = self.handle.read().await;
                let handle = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
                handle.channel_open_session().await.map_err(|e| {
                    ConnectionError::ExecutionFailed(format!("Failed to open channel: {}", e))
                })?
            };

            channel.exec(true, full_command).await.map_err(|e| {
                ConnectionError::ExecutionFailed(format!("Failed to execute command: {}", e))
            })?;

            if let Some(data) = stdin {
                channel.data(data).await.map_err(|e| {
                    ConnectionError::ExecutionFailed(format!("Failed to write stdin: {}", e))
                })?;
            }
            channel.eof().await.map_err(|e| {
                ConnectionError::ExecutionFailed(format!("Failed to send EOF: {}", e))
            })?;

            let mut output = RawOutput {
                exit_code: -1,
                stdout: Vec::new(),
                stderr: Vec::new(),
            };
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                    // Extended data type 1 is stderr
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        output.stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        output.exit_code = exit_status as i32
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
            Ok::<_, ConnectionError>(output)
        };

        let timeout = self.base.config().timeout_duration();
        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(timeout.as_secs())),
        }
    }

    async fn run_checked(&self, command: &str, stdin: Option<&[u8]>) -> ConnectionResult<Vec<u8>> {
        let output = self.run_raw(command, stdin).await?;
        if output.exit_code != 0 {
            return Err(ConnectionError::ExecutionFailed(format!(
                "'{}' exited with {}: {}",
                command,
                output.exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

async fn try_key(
    session: &mut Handle<ClientHandler>,
    user: &str,
    key_pair: russh::keys::key::KeyPair,
) -> ConnectionResult<bool> {
    session
        .authenticate_publickey(user, Arc::new(key_pair))
        .await
        .map_err(|e| ConnectionError::AuthenticationFailed(format!("Key authentication failed: {}", e)))
}

/// Build a quoted-heredoc upload, or `None` when the content can't be sent that way
fn heredoc_upload(content: &[u8], dest: &str, mode: u32) -> Option<String> {
    const MARKER: &str = "CONVOY_EOF";

    let text = std::str::from_utf8(content).ok()?;
    if !text.ends_with('\n') || text.lines().any(|l| l == MARKER) {
        return None;
    }
    Some(format!(
        "cat > {dest} <<'{marker}'\n{text}{marker}\nchmod {mode:o} {dest}",
        dest = dest,
        marker = MARKER,
        text = text,
        mode = mode
    ))
}

#[cfg(unix)]
fn local_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn local_mode(_path: &Path) -> u32 {
    0o644
}

#[async_trait]
impl Connection for SshConnection {
    fn base(&self) -> &BaseConnection {
        &self.base
    }

    fn connection_type(&self) -> &str {
        "ssh"
    }

    async fn connect(&self) -> ConnectionResult<()> {
        if self.base.is_connected() {
            return Ok(());
        }
        let session = self.do_connect().await?;
        *self.handle.write().await = Some(session);
        self.base.set_connected(true);
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.base.set_connected(false);
        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            debug!(host = %self.host(), "Closing SSH connection");
            let _ = handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "Connection closed by client",
                    "en",
                )
                .await;
        }
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> ConnectionResult<CommandResult> {
        let start = Instant::now();
        let output = self.run_raw(command, stdin).await?;
        trace!(exit_code = %output.exit_code, "Command completed");

        Ok(CommandResult::new(
            output.exit_code,
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            start.elapsed(),
        ))
    }

    async fn put_file(&self, local_path: &Path, remote_path: &Path) -> ConnectionResult<()> {
        let content = std::fs::read(local_path).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to read {}: {}",
                local_path.display(),
                e
            ))
        })?;
        let mode = local_mode(local_path);
        let dest = shell_quote(&remote_path.to_string_lossy());
        debug!(src = %local_path.display(), dst = %remote_path.display(), size = %content.len(), "Uploading file");

        let result = match heredoc_upload(&content, &dest, mode) {
            Some(script) => self.run_checked(&script, None).await,
            None => {
                let script = format!("cat > {dest} && chmod {mode:o} {dest}", dest = dest, mode = mode);
                self.run_checked(&script, Some(&content)).await
            }
        };
        result
            .map(|_| ())
            .map_err(|e| ConnectionError::TransferFailed(e.to_string()))
    }

    async fn get_file(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()> {
        debug!(src = %remote_path.display(), dst = %local_path.display(), "Downloading file");
        let command = format!("cat {}", shell_quote(&remote_path.to_string_lossy()));
        let content = self
            .run_checked(&command, None)
            .await
            .map_err(|e| ConnectionError::TransferFailed(e.to_string()))?;

        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(local_path, content).map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to write {}: {}",
                local_path.display(),
                e
            ))
        })
    }

    async fn file_exists(&self, path: &Path) -> ConnectionResult<bool> {
        let command = format!("test -e {}", shell_quote(&path.to_string_lossy()));
        Ok(self.run_raw(&command, None).await?.exit_code == 0)
    }

    async fn create_directory(&self, path: &Path, mode: u32) -> ConnectionResult<()> {
        let quoted = shell_quote(&path.to_string_lossy());
        let command = format!("mkdir -p {p} && chmod {mode:o} {p}", p = quoted, mode = mode);
        self.run_checked(&command, None).await.map(|_| ())
    }

    async fn remove_file(&self, path: &Path) -> ConnectionResult<()> {
        let command = format!("rm -f {}", shell_quote(&path.to_string_lossy()));
        self.run_checked(&command, None).await.map(|_| ())
    }

    async fn get_file_info(&self, path: &Path) -> ConnectionResult<FileInfo> {
        let command = format!(
            "stat -c '{}' {}",
            STAT_FORMAT,
            shell_quote(&path.to_string_lossy())
        );
        let output = self.run_checked(&command, None).await?;
        parse_stat_output(&String::from_utf8_lossy(&output))
    }
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.base.config().host)
            .field("port", &self.port())
            .field("connected", &self.base.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches_plain_host() {
        assert!(pattern_matches("web1.example.com", "web1.example.com", 22));
        assert!(!pattern_matches("web1.example.com", "web1.example.com", 2222));
        assert!(!pattern_matches("web2.example.com", "web1.example.com", 22));
    }

    #[test]
    fn test_pattern_matches_bracketed_port() {
        assert!(pattern_matches("[web1]:2222", "web1", 2222));
        assert!(!pattern_matches("[web1]:2222", "web1", 22));
    }

    #[test]
    fn test_pattern_matches_wildcards() {
        assert!(pattern_matches("*.example.com", "db.example.com", 22));
        assert!(pattern_matches("web?", "web1", 22));
        assert!(!pattern_matches("web?", "web12", 22));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("a*c", "abbbc"));
        assert!(!wildcard_match("a*c", "abbbd"));
    }

    #[test]
    fn test_parse_known_hosts_line_rejects_garbage() {
        assert!(parse_known_hosts_line("host ssh-ed25519").is_none());
        assert!(parse_known_hosts_line("host ssh-ed25519 !!notbase64!!").is_none());
    }

    #[test]
    fn test_parse_stat_output() {
        let info = parse_stat_output("4096|755|1700000000|directory|root|wheel\n").unwrap();
        assert_eq!(
            info,
            FileInfo {
                size: 4096,
                mode: 0o755,
                mtime: 1_700_000_000,
                is_dir: true,
                owner: "root".into(),
                group: "wheel".into(),
            }
        );

        let file = parse_stat_output("12|644|1|regular file|app|app").unwrap();
        assert!(!file.is_dir);
        assert_eq!(file.mode, 0o644);

        assert!(parse_stat_output("garbage").is_err());
    }

    #[test]
    fn test_heredoc_upload() {
        let script = heredoc_upload(b"line one\nline two\n", "'/tmp/f'", 0o600).unwrap();
        assert_eq!(
            script,
            "cat > '/tmp/f' <<'CONVOY_EOF'\nline one\nline two\nCONVOY_EOF\nchmod 600 '/tmp/f'"
        );

        // No trailing newline, binary and marker collisions fall back to stdin.
        assert!(heredoc_upload(b"no newline", "'/tmp/f'", 0o644).is_none());
        assert!(heredoc_upload(&[0xff, 0xfe, b'\n'], "'/tmp/f'", 0o644).is_none());
        assert!(heredoc_upload(b"CONVOY_EOF\n", "'/tmp/f'", 0o644).is_none());
    }

    #[tokio::test]
    async fn test_execute_requires_connect() {
        let conn = SshConnection::new(ConnectionConfig::new("web1"));
        let result = conn.execute("true", None).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
        assert_eq!(conn.connection_type(), "ssh");
    }

    #[test]
    fn test_environment_exports_sorted() {
        let conn = SshConnection::new(
            ConnectionConfig::new("web1")
                .with_env("B", "two words")
                .with_env("A", "1"),
        );
        assert_eq!(
            conn.with_environment("env".into()),
            "export A='1'; export B='two words'; env"
        );
    }

    #[test]
    fn test_escalated_scripts_run_whole_under_sudo() {
        let conn = SshConnection::new(
            ConnectionConfig::new("web1").with_become("sudo", Some("root".into())),
        );
        assert_eq!(conn.remote_command("id -u"), "sudo -u root id -u");

        let upload = heredoc_upload(b"motd\n", "'/etc/motd'", 0o644).unwrap();
        assert_eq!(
            conn.remote_command(&upload),
            format!("sudo -u root /bin/sh -c {}", shell_quote(&upload))
        );
        assert_eq!(
            conn.remote_command("mkdir -p /srv && chmod 755 /srv"),
            "sudo -u root /bin/sh -c 'mkdir -p /srv && chmod 755 /srv'"
        );
    }

    #[test]
    fn test_environment_is_exported_inside_escalated_shell() {
        let conn = SshConnection::new(
            ConnectionConfig::new("web1")
                .with_become("sudo", Some("app".into()))
                .with_env("A", "1"),
        );
        assert_eq!(
            conn.remote_command("env"),
            r"sudo -u app /bin/sh -c 'export A='\''1'\''; env'"
        );
    }
}

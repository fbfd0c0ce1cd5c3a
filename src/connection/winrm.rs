//! WinRM connection module
//!
//! Windows Remote Management over WS-Management SOAP with HTTP Basic
//! authentication. Every operation creates a cmd shell, runs a single
//! `powershell.exe -EncodedCommand` invocation, collects its output and
//! deletes the shell again.

use async_trait::async_trait;
use base64::prelude::*;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::config::DEFAULT_WINRM_PORT;
use super::{
    BaseConnection, CommandResult, Connection, ConnectionConfig, ConnectionError,
    ConnectionResult, FileInfo,
};

/// Default WinRM HTTPS port
pub const DEFAULT_WINRM_SSL_PORT: u16 = 5986;

/// Raw bytes per upload chunk, kept under PowerShell command-line limits
const UPLOAD_CHUNK_SIZE: usize = 48 * 1024;

const MAX_ENVELOPE_SIZE: u32 = 153_600;

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const WSMID_NS: &str = "http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// WinRM connection for executing commands on Windows hosts
pub struct WinRmConnection {
    base: BaseConnection,
    client: Client,
    endpoint: String,
}

impl WinRmConnection {
    /// Create a disconnected WinRM connection.
    ///
    /// Recognized `extra` options: `scheme` ("http"/"https"), `use_ssl`,
    /// `path` (default `/wsman`) and `cert_validation`.
    pub fn new(config: ConnectionConfig) -> ConnectionResult<Self> {
        let verify_certs = config.extra_bool("cert_validation").unwrap_or(true);
        let client = Client::builder()
            .timeout(config.timeout_duration())
            .connect_timeout(config.connect_timeout_duration())
            .danger_accept_invalid_certs(!verify_certs)
            .build()
            .map_err(|e| {
                ConnectionError::InvalidConfig(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            endpoint: endpoint_url(&config),
            base: BaseConnection::new(config),
            client,
        })
    }

    /// The WS-Management endpoint this connection talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, body: String) -> ConnectionResult<String> {
        let config = self.base.config();
        let user = config.user_or_current();

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(user, config.password.as_deref())
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectionError::Timeout(config.timeout_duration().as_secs())
                } else {
                    ConnectionError::ConnectionFailed(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to read response: {}", e))
        })?;

        match status {
            s if s.is_success() => Ok(text),
            StatusCode::UNAUTHORIZED => Err(ConnectionError::AuthenticationFailed(format!(
                "WinRM rejected credentials for {}",
                self.base.config().host
            ))),
            s => Err(ConnectionError::ExecutionFailed(format!(
                "WinRM request failed: {} - {}",
                s,
                extract_tag(&text, "s:Text").unwrap_or(&text)
            ))),
        }
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, headers: &str, body: &str) -> String {
        let selector = shell_id
            .map(|id| {
                format!(
                    r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                    id
                )
            })
            .unwrap_or_default();
        let timeout = self.base.config().timeout_duration().as_secs();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{endpoint}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo><a:Address s:mustUnderstand="true">{ANONYMOUS}</a:Address></a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT{timeout}S</w:OperationTimeout>
    {selector}{headers}
  </s:Header>
  <s:Body>{body}</s:Body>
</s:Envelope>"#,
            endpoint = self.endpoint,
            action = action,
            message_id = Uuid::new_v4(),
            timeout = timeout,
            selector = selector,
            headers = headers,
            body = body,
        )
    }

    async fn create_shell(&self) -> ConnectionResult<String> {
        let headers = r#"<w:OptionSet><w:Option Name="WINRS_NOPROFILE">TRUE</w:Option><w:Option Name="WINRS_CODEPAGE">65001</w:Option></w:OptionSet>"#;
        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
        let response = self
            .send(self.envelope(ACTION_CREATE, None, headers, body))
            .await?;

        let shell_id = extract_tag(&response, "rsp:ShellId")
            .or_else(|| extract_selector(&response, "ShellId"))
            .ok_or_else(|| {
                ConnectionError::ExecutionFailed("Failed to parse shell ID from response".into())
            })?
            .to_string();
        trace!(shell_id = %shell_id, "Created WinRM shell");
        Ok(shell_id)
    }

    async fn run_command(&self, shell_id: &str, command_line: &str) -> ConnectionResult<String> {
        let headers = r#"<w:OptionSet><w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option><w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option></w:OptionSet>"#;
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            xml_escape(command_line)
        );
        let response = self
            .send(self.envelope(ACTION_COMMAND, Some(shell_id), headers, &body))
            .await?;

        extract_tag(&response, "rsp:CommandId")
            .map(String::from)
            .ok_or_else(|| {
                ConnectionError::ExecutionFailed("Failed to parse command ID from response".into())
            })
    }

    async fn receive_output(
        &self,
        shell_id: &str,
        command_id: &str,
    ) -> ConnectionResult<ReceivedOutput> {
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            command_id
        );
        let mut output = ReceivedOutput::default();

        loop {
            let response = self
                .send(self.envelope(ACTION_RECEIVE, Some(shell_id), "", &body))
                .await?;
            if output.absorb(&response) {
                return Ok(output);
            }
        }
    }

    async fn cleanup(&self, shell_id: &str, command_id: Option<&str>) {
        if let Some(command_id) = command_id {
            let body = format!(
                r#"<rsp:Signal CommandId="{}"><rsp:Code>{}</rsp:Code></rsp:Signal>"#,
                command_id, SIGNAL_TERMINATE
            );
            if let Err(e) = self
                .send(self.envelope(ACTION_SIGNAL, Some(shell_id), "", &body))
                .await
            {
                warn!(shell_id = %shell_id, error = %e, "Failed to signal command termination");
            }
        }
        if let Err(e) = self
            .send(self.envelope(ACTION_DELETE, Some(shell_id), "", ""))
            .await
        {
            warn!(shell_id = %shell_id, error = %e, "Failed to delete shell");
        }
    }

    /// Run a PowerShell script in a fresh shell
    async fn run_script(&self, script: &str) -> ConnectionResult<CommandResult> {
        let start = Instant::now();
        let command_line = format!(
            "powershell.exe -NoProfile -NonInteractive -ExecutionPolicy Bypass -EncodedCommand {}",
            encode_powershell(script)
        );

        let shell_id = self.create_shell().await?;
        let command_id = match self.run_command(&shell_id, &command_line).await {
            Ok(id) => id,
            Err(e) => {
                self.cleanup(&shell_id, None).await;
                return Err(e);
            }
        };
        let received = within(
            self.base.config().timeout_duration(),
            self.receive_output(&shell_id, &command_id),
        )
        .await;
        self.cleanup(&shell_id, Some(&command_id)).await;
        let received = received?;

        trace!(exit_code = %received.exit_code, "WinRM command completed");
        Ok(CommandResult::new(
            received.exit_code,
            String::from_utf8_lossy(&received.stdout).to_string(),
            String::from_utf8_lossy(&received.stderr).to_string(),
            start.elapsed(),
        ))
    }

    async fn run_checked(&self, script: &str, what: &str) -> ConnectionResult<CommandResult> {
        self.base.ensure_connected()?;
        let result = self.run_script(script).await?;
        if !result.success() {
            return Err(ConnectionError::ExecutionFailed(format!(
                "{} failed: {}",
                what,
                result.stderr.trim()
            )));
        }
        Ok(result)
    }
}

/// Accumulated output of a Receive loop
#[derive(Debug, Default)]
struct ReceivedOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
}

impl ReceivedOutput {
    /// Append one Receive response; returns true once the command is done
    fn absorb(&mut self, response: &str) -> bool {
        let mut pos = 0;
        while let Some(start) = response[pos..].find("<rsp:Stream ") {
            let tag_start = pos + start;
            let Some(tag_len) = response[tag_start..].find('>') else {
                break;
            };
            let tag = &response[tag_start..tag_start + tag_len];
            let content_start = tag_start + tag_len + 1;

            // Self-closing stream elements carry only the End marker.
            if tag.ends_with('/') {
                pos = content_start;
                continue;
            }
            let Some(content_len) = response[content_start..].find("</rsp:Stream>") else {
                break;
            };
            let content = response[content_start..content_start + content_len].trim();
            if let Ok(decoded) = BASE64_STANDARD.decode(content) {
                if tag.contains(r#"Name="stderr""#) {
                    self.stderr.extend_from_slice(&decoded);
                } else {
                    self.stdout.extend_from_slice(&decoded);
                }
            }
            pos = content_start + content_len;
        }

        if let Some(code) = extract_tag(response, "rsp:ExitCode").and_then(|c| c.parse().ok()) {
            self.exit_code = code;
        }
        response.contains("CommandState/Done")
            || response.contains(r#"State="Done""#)
    }
}

#[async_trait]
impl Connection for WinRmConnection {
    fn base(&self) -> &BaseConnection {
        &self.base
    }

    fn connection_type(&self) -> &str {
        "winrm"
    }

    /// Wrap the script in an elevated `Start-Process`.
    ///
    /// With a `become_user`, the process runs under that user's credentials
    /// instead of the RunAs verb.
    fn apply_become(&self, command: &str) -> String {
        let config = self.base.config();
        if !config.r#become {
            return command.to_string();
        }

        let args = format!(
            "-ArgumentList '-NoProfile','-NonInteractive','-EncodedCommand','{}'",
            encode_powershell(command)
        );
        match &config.become_user {
            Some(user) => format!(
                "$pw = ConvertTo-SecureString {} -AsPlainText -Force; \
                 $cred = New-Object System.Management.Automation.PSCredential({}, $pw); \
                 $p = Start-Process powershell.exe -Credential $cred -Wait -PassThru -NoNewWindow {}; \
                 exit $p.ExitCode",
                ps_quote(config.become_password.as_deref().unwrap_or("")),
                ps_quote(user),
                args
            ),
            None => format!(
                "$p = Start-Process powershell.exe -Verb RunAs -Wait -PassThru {}; exit $p.ExitCode",
                args
            ),
        }
    }

    async fn connect(&self) -> ConnectionResult<()> {
        if self.base.is_connected() {
            return Ok(());
        }
        debug!(endpoint = %self.endpoint, "Identifying WinRM endpoint");

        let identify = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:wsmid="{WSMID_NS}">
  <s:Header/>
  <s:Body><wsmid:Identify/></s:Body>
</s:Envelope>"#
        );
        self.send(identify).await.map_err(|e| match e {
            ConnectionError::ExecutionFailed(msg) => ConnectionError::ConnectionFailed(msg),
            other => other,
        })?;

        self.base.set_connected(true);
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        // Shells are per-operation, so there is nothing left open.
        self.base.set_connected(false);
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> ConnectionResult<CommandResult> {
        self.base.ensure_connected()?;
        debug!(host = %self.host(), command = %command, "Executing WinRM command");

        let mut script = String::new();
        let mut keys: Vec<&String> = self.base.config().environment.keys().collect();
        keys.sort();
        for key in keys {
            script.push_str(&format!(
                "$env:{} = {}; ",
                key,
                ps_quote(&self.base.config().environment[key])
            ));
        }

        let command = self.apply_become(command);
        match stdin {
            Some(data) => script.push_str(&format!(
                "[Text.Encoding]::UTF8.GetString([Convert]::FromBase64String('{}')) | & {{ {} }}",
                BASE64_STANDARD.encode(data),
                command
            )),
            None => script.push_str(&command),
        }

        self.run_script(&script).await
    }

    async fn put_file(&self, local_path: &Path, remote_path: &Path) -> ConnectionResult<()> {
        let content = std::fs::read(local_path).map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to read local file: {}", e))
        })?;
        let dest = ps_quote(&remote_path.to_string_lossy());
        debug!(remote = %remote_path.display(), size = %content.len(), "Uploading file via WinRM");

        let mut chunks = content.chunks(UPLOAD_CHUNK_SIZE).peekable();
        if chunks.peek().is_none() {
            let script = format!("[System.IO.File]::WriteAllBytes({}, [byte[]]@())", dest);
            return self
                .run_checked(&script, "upload")
                .await
                .map(|_| ())
                .map_err(|e| ConnectionError::TransferFailed(e.to_string()));
        }

        for (i, chunk) in chunks.enumerate() {
            let encoded = BASE64_STANDARD.encode(chunk);
            let script = if i == 0 {
                format!(
                    "[System.IO.File]::WriteAllBytes({}, [Convert]::FromBase64String('{}'))",
                    dest, encoded
                )
            } else {
                format!(
                    "$bytes = [Convert]::FromBase64String('{}'); \
                     $stream = [System.IO.File]::Open({}, [System.IO.FileMode]::Append); \
                     try {{ $stream.Write($bytes, 0, $bytes.Length) }} finally {{ $stream.Close() }}",
                    encoded, dest
                )
            };
            self.run_checked(&script, "upload")
                .await
                .map_err(|e| ConnectionError::TransferFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn get_file(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()> {
        let script = format!(
            "[Convert]::ToBase64String([System.IO.File]::ReadAllBytes({}))",
            ps_quote(&remote_path.to_string_lossy())
        );
        let result = self
            .run_checked(&script, "download")
            .await
            .map_err(|e| ConnectionError::TransferFailed(e.to_string()))?;

        let content = BASE64_STANDARD.decode(result.stdout.trim()).map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to decode file content: {}", e))
        })?;
        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(local_path, content).map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to write local file: {}", e))
        })
    }

    async fn file_exists(&self, path: &Path) -> ConnectionResult<bool> {
        let script = format!("Test-Path -LiteralPath {}", ps_quote(&path.to_string_lossy()));
        let result = self.run_checked(&script, "Test-Path").await?;
        Ok(result.stdout.trim().eq_ignore_ascii_case("true"))
    }

    async fn create_directory(&self, path: &Path, _mode: u32) -> ConnectionResult<()> {
        let script = format!(
            "New-Item -ItemType Directory -Force -Path {} | Out-Null",
            ps_quote(&path.to_string_lossy())
        );
        self.run_checked(&script, "New-Item").await.map(|_| ())
    }

    async fn remove_file(&self, path: &Path) -> ConnectionResult<()> {
        let quoted = ps_quote(&path.to_string_lossy());
        let script = format!(
            "if (Test-Path -LiteralPath {p}) {{ Remove-Item -LiteralPath {p} -Force }}",
            p = quoted
        );
        self.run_checked(&script, "Remove-Item").await.map(|_| ())
    }

    async fn get_file_info(&self, path: &Path) -> ConnectionResult<FileInfo> {
        let quoted = ps_quote(&path.to_string_lossy());
        let script = format!(
            "$item = Get-Item -LiteralPath {p} -Force; \
             $owner = (Get-Acl -LiteralPath {p}).Owner; \
             @{{ Size = [int64]$item.Length; IsDirectory = $item.PSIsContainer; \
                 ReadOnly = $item.Attributes.ToString().Contains('ReadOnly'); \
                 LastWriteTime = [int64](Get-Date $item.LastWriteTimeUtc -UFormat %s); \
                 Owner = $owner }} | ConvertTo-Json -Compress",
            p = quoted
        );
        let result = self.run_checked(&script, "Get-Item").await?;
        parse_file_info_json(&result.stdout)
    }
}

impl std::fmt::Debug for WinRmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmConnection")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.base.is_connected())
            .finish()
    }
}

/// Build the endpoint URL from host, port and `extra` options
fn endpoint_url(config: &ConnectionConfig) -> String {
    let use_ssl = match config.extra_str("scheme") {
        Some(scheme) => scheme.eq_ignore_ascii_case("https"),
        None => config.extra_bool("use_ssl").unwrap_or(false),
    };
    let (scheme, default_port) = if use_ssl {
        ("https", DEFAULT_WINRM_SSL_PORT)
    } else {
        ("http", DEFAULT_WINRM_PORT)
    };
    let path = config.extra_str("path").unwrap_or("/wsman");
    let path = path.strip_prefix('/').unwrap_or(path);

    format!(
        "{}://{}:{}/{}",
        scheme,
        config.host,
        config.port_or(default_port),
        path
    )
}

/// Encode a script for `powershell.exe -EncodedCommand` (UTF-16LE, base64)
fn encode_powershell(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    BASE64_STANDARD.encode(utf16)
}

/// Single-quote a PowerShell string literal
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Escape special characters for XML
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Text content of the first `<tag>...</tag>` element
fn extract_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);

    let mut search = 0;
    while let Some(found) = xml[search..].find(&open) {
        let start = search + found;
        let after = start + open.len();
        // Skip longer tag names sharing this prefix.
        match xml[after..].chars().next() {
            Some('>') | Some(' ') => {}
            _ => {
                search = after;
                continue;
            }
        }
        let content_start = after + xml[after..].find('>')? + 1;
        let end = xml[content_start..].find(&close)?;
        return Some(xml[content_start..content_start + end].trim());
    }
    None
}

/// Value of `<w:Selector Name="name">...</w:Selector>`
fn extract_selector<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!(r#"Name="{}">"#, name);
    let start = xml.find(&marker)? + marker.len();
    let end = xml[start..].find("</")?;
    Some(xml[start..start + end].trim())
}

fn parse_file_info_json(output: &str) -> ConnectionResult<FileInfo> {
    let json: serde_json::Value = serde_json::from_str(output.trim()).map_err(|e| {
        ConnectionError::ExecutionFailed(format!("Failed to parse stat output: {}", e))
    })?;

    let is_dir = json
        .get("IsDirectory")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let read_only = json
        .get("ReadOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let owner = json
        .get("Owner")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    // Windows has no group ownership; report the owner's domain part.
    let group = owner
        .split_once('\\')
        .map(|(domain, _)| domain.to_string())
        .unwrap_or_default();

    Ok(FileInfo {
        size: json.get("Size").and_then(|v| v.as_u64()).unwrap_or(0),
        mode: match (is_dir, read_only) {
            (true, _) => 0o755,
            (false, true) => 0o444,
            (false, false) => 0o644,
        },
        mtime: json
            .get("LastWriteTime")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        is_dir,
        owner,
        group,
    })
}

/// Run `fut` with an overall deadline, mapping expiry to `Timeout`
async fn within<T>(
    timeout: Duration,
    fut: impl Future<Output = ConnectionResult<T>>,
) -> ConnectionResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout(timeout.as_secs())),
    }
}

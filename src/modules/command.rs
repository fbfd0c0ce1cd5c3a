//! Command module - Execute arbitrary commands
//!
//! Runs a command on the target through its connection. `argv` entries are
//! quoted individually; `cmd` is passed through as written. For shell
//! features with an explicit interpreter, use the shell module.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;

use super::{
    parse_args, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult,
    ModuleReturn,
};
use crate::connection::base::shell_quote;

#[derive(Debug, Deserialize)]
struct CommandArgs {
    #[serde(default, alias = "_raw_params")]
    cmd: Option<String>,
    #[serde(default)]
    argv: Option<Vec<String>>,
    #[serde(default)]
    chdir: Option<String>,
    #[serde(default)]
    creates: Option<String>,
    #[serde(default)]
    removes: Option<String>,
    #[serde(default)]
    stdin: Option<String>,
}

/// Shared options of the command and shell modules
pub(crate) struct RunOptions<'a> {
    pub chdir: Option<&'a str>,
    pub creates: Option<&'a str>,
    pub removes: Option<&'a str>,
    pub stdin: Option<&'a str>,
}

/// Module for executing commands directly
pub struct CommandModule;

impl CommandModule {
    fn build_command(args: &CommandArgs) -> ModuleResult<String> {
        match (&args.argv, &args.cmd) {
            (Some(argv), _) if argv.is_empty() => Err(ModuleError::InvalidParameter(
                "argv cannot be empty".to_string(),
            )),
            (Some(argv), _) => Ok(argv
                .iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" ")),
            (None, Some(cmd)) if cmd.trim().is_empty() => Err(ModuleError::InvalidParameter(
                "cmd cannot be empty".to_string(),
            )),
            (None, Some(cmd)) => Ok(cmd.clone()),
            (None, None) => Err(ModuleError::MissingParameter(
                "Either 'cmd' or 'argv' must be provided".to_string(),
            )),
        }
    }
}

/// Run `command` with the creates/removes guards, reporting in the usual shape.
///
/// A non-zero exit code is reported as `failed` in the result map rather
/// than as an error, so `ignore_errors` can act on it.
pub(crate) async fn run_command(
    context: &ModuleContext,
    command: &str,
    options: RunOptions<'_>,
) -> ModuleResult<ModuleReturn> {
    if options.creates.is_some() || options.removes.is_some() {
        let conn = context.connection().await?;
        if let Some(creates) = options.creates {
            if conn.file_exists(Path::new(creates)).await? {
                return Ok(ModuleOutput::ok(format!("Skipped, '{}' exists", creates)).into_map());
            }
        }
        if let Some(removes) = options.removes {
            if !conn.file_exists(Path::new(removes)).await? {
                return Ok(
                    ModuleOutput::ok(format!("Skipped, '{}' does not exist", removes)).into_map(),
                );
            }
        }
    }

    let full = match options.chdir {
        Some(dir) => format!("cd {} && {}", shell_quote(dir), command),
        None => command.to_string(),
    };

    let output = context
        .run_command(&full, options.stdin.map(str::as_bytes))
        .await?;

    let result = if output.success() {
        ModuleOutput::changed("")
    } else {
        let mut failed = ModuleOutput::failed("non-zero return code");
        failed.changed = true;
        failed
    };

    Ok(result
        .with_command_output(&output)
        .with_data("cmd", command.into())
        .with_data("delta_ms", (output.duration.as_millis() as u64).into())
        .into_map())
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "Execute commands on the target"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let args: CommandArgs = parse_args(params)?;
        Self::build_command(&args).map(|_| ())
    }

    async fn execute(&self, context: &ModuleContext) -> ModuleResult<ModuleReturn> {
        let args: CommandArgs = parse_args(&context.args)?;
        let command = Self::build_command(&args)?;

        run_command(
            context,
            &command,
            RunOptions {
                chdir: args.chdir.as_deref(),
                creates: args.creates.as_deref(),
                removes: args.removes.as_deref(),
                stdin: args.stdin.as_deref(),
            },
        )
        .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(args: serde_json::Value) -> ModuleContext {
        ModuleContext::new("localhost")
            .with_connection_type("local")
            .with_args(args.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_command_echo() {
        let result = CommandModule
            .execute(&context(json!({"cmd": "echo hello"})))
            .await
            .unwrap();

        assert_eq!(result["changed"], json!(true));
        assert_eq!(result["rc"], json!(0));
        assert!(result["stdout"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_command_with_argv_quotes_arguments() {
        let result = CommandModule
            .execute(&context(json!({"argv": ["echo", "hello world", "$HOME"]})))
            .await
            .unwrap();

        assert_eq!(result["stdout_lines"], json!(["hello world $HOME"]));
    }

    #[tokio::test]
    async fn test_command_creates_exists() {
        let result = CommandModule
            .execute(&context(json!({"cmd": "echo hello", "creates": "/"})))
            .await
            .unwrap();

        assert_eq!(result["changed"], json!(false));
        assert!(result["msg"].as_str().unwrap().contains("Skipped"));
    }

    #[tokio::test]
    async fn test_command_chdir_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let result = CommandModule
            .execute(&context(json!({
                "cmd": "pwd && cat",
                "chdir": dir.path().to_str().unwrap(),
                "stdin": "piped"
            })))
            .await
            .unwrap();

        let stdout = result["stdout"].as_str().unwrap();
        assert!(stdout.contains("piped"));
        let name = dir.path().file_name().unwrap().to_str().unwrap();
        assert!(stdout.contains(name));
    }

    #[tokio::test]
    async fn test_command_nonzero_reports_failed() {
        let result = CommandModule
            .execute(&context(json!({"cmd": "false"})))
            .await
            .unwrap();

        assert_eq!(result["failed"], json!(true));
        assert_ne!(result["rc"], json!(0));
    }

    #[test]
    fn test_validate_params() {
        let params = |v: serde_json::Value| v.as_object().cloned().unwrap();
        assert!(CommandModule.validate_params(&params(json!({"cmd": "ls"}))).is_ok());
        assert!(CommandModule
            .validate_params(&params(json!({"_raw_params": "ls"})))
            .is_ok());
        assert!(matches!(
            CommandModule.validate_params(&params(json!({}))),
            Err(ModuleError::MissingParameter(_))
        ));
        assert!(matches!(
            CommandModule.validate_params(&params(json!({"argv": []}))),
            Err(ModuleError::InvalidParameter(_))
        ));
    }
}

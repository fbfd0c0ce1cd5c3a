//! Shell module - Execute shell commands
//!
//! Runs a command line through an explicit interpreter on the target, so
//! pipes, redirects and variable expansion behave the same regardless of
//! the login shell of the connecting user.

use async_trait::async_trait;
use serde::Deserialize;

use super::command::{run_command, RunOptions};
use super::{parse_args, Module, ModuleContext, ModuleError, ModuleParams, ModuleResult, ModuleReturn};
use crate::connection::base::shell_quote;

const DEFAULT_EXECUTABLE: &str = "/bin/sh";

#[derive(Debug, Deserialize)]
struct ShellArgs {
    #[serde(alias = "_raw_params")]
    cmd: String,
    #[serde(default)]
    executable: Option<String>,
    #[serde(default)]
    chdir: Option<String>,
    #[serde(default)]
    creates: Option<String>,
    #[serde(default)]
    removes: Option<String>,
    #[serde(default)]
    stdin: Option<String>,
}

/// Module for executing shell commands
pub struct ShellModule;

impl ShellModule {
    fn wrap(args: &ShellArgs) -> String {
        let executable = args.executable.as_deref().unwrap_or(DEFAULT_EXECUTABLE);
        let flag = if executable.ends_with("cmd.exe") || executable.ends_with("cmd") {
            "/c"
        } else {
            "-c"
        };
        format!("{} {} {}", executable, flag, shell_quote(&args.cmd))
    }
}

#[async_trait]
impl Module for ShellModule {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn description(&self) -> &'static str {
        "Execute shell commands on the target"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let args: ShellArgs = parse_args(params)?;
        if args.cmd.trim().is_empty() {
            return Err(ModuleError::InvalidParameter("cmd cannot be empty".to_string()));
        }
        Ok(())
    }

    async fn execute(&self, context: &ModuleContext) -> ModuleResult<ModuleReturn> {
        let args: ShellArgs = parse_args(&context.args)?;
        let command = Self::wrap(&args);

        let mut result = run_command(
            context,
            &command,
            RunOptions {
                chdir: args.chdir.as_deref(),
                creates: args.creates.as_deref(),
                removes: args.removes.as_deref(),
                stdin: args.stdin.as_deref(),
            },
        )
        .await?;
        if result.contains_key("cmd") {
            result.insert("cmd".into(), args.cmd.into());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: serde_json::Value) -> ModuleParams {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_wrap_default_and_custom_executable() {
        let args: ShellArgs = parse_args(&params(json!({"cmd": "echo $HOME | wc -c"}))).unwrap();
        assert_eq!(ShellModule::wrap(&args), "/bin/sh -c 'echo $HOME | wc -c'");

        let args: ShellArgs =
            parse_args(&params(json!({"cmd": "echo it's", "executable": "/bin/bash"}))).unwrap();
        assert_eq!(ShellModule::wrap(&args), "/bin/bash -c 'echo it'\\''s'");
    }

    #[test]
    fn test_validate_params() {
        assert!(ShellModule.validate_params(&params(json!({"cmd": "ls"}))).is_ok());
        assert!(ShellModule.validate_params(&params(json!({"cmd": " "}))).is_err());
        assert!(ShellModule.validate_params(&params(json!({}))).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_pipes() {
        let ctx = ModuleContext::new("localhost")
            .with_connection_type("local")
            .with_args(params(json!({"cmd": "printf 'a\\nb\\n' | wc -l"})));
        let result = ShellModule.execute(&ctx).await.unwrap();

        assert_eq!(result["rc"], json!(0));
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "2");
        assert_eq!(result["cmd"], json!("printf 'a\\nb\\n' | wc -l"));
    }
}

//! Ping module - Check that the target is reachable and can run commands

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_args, Module, ModuleContext, ModuleError, ModuleOutput, ModuleResult, ModuleReturn};
use crate::connection::base::shell_quote;

#[derive(Debug, Deserialize)]
struct PingArgs {
    #[serde(default = "default_data")]
    data: String,
}

fn default_data() -> String {
    "pong".to_string()
}

/// Module that round-trips a value through the target's shell
pub struct PingModule;

#[async_trait]
impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn description(&self) -> &'static str {
        "Try to connect to the host and run a trivial command"
    }

    async fn execute(&self, context: &ModuleContext) -> ModuleResult<ModuleReturn> {
        let args: PingArgs = parse_args(&context.args)?;
        if args.data == "crash" {
            return Err(ModuleError::ExecutionFailed("boom".to_string()));
        }

        let output = context
            .run_command(&format!("echo {}", shell_quote(&args.data)), None)
            .await?;
        if !output.success() {
            return Err(ModuleError::CommandFailed {
                code: output.exit_code,
                message: output.combined_output(),
            });
        }

        Ok(ModuleOutput::ok("")
            .with_data("ping", Value::String(output.stdout.trim_end().to_string()))
            .into_map())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(args: Value) -> ModuleContext {
        ModuleContext::new("localhost")
            .with_connection_type("local")
            .with_args(args.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_ping_default() {
        let result = PingModule.execute(&context(json!({}))).await.unwrap();
        assert_eq!(result["ping"], json!("pong"));
        assert_eq!(result["changed"], json!(false));
    }

    #[tokio::test]
    async fn test_ping_custom_data_and_crash() {
        let result = PingModule
            .execute(&context(json!({"data": "hello there"})))
            .await
            .unwrap();
        assert_eq!(result["ping"], json!("hello there"));

        assert!(PingModule
            .execute(&context(json!({"data": "crash"})))
            .await
            .is_err());
    }
}

//! Debug action - Print messages and variable values
//!
//! Runs entirely on the control node and never opens a connection. `msg` is
//! rendered as a template against the task's variables and facts.

use async_trait::async_trait;
use minijinja::Environment;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use super::{parse_args, ActionPlugin, ModuleContext, ModuleError, ModuleOutput, ModuleResult, ModuleReturn};

#[derive(Debug, Deserialize)]
struct DebugArgs {
    #[serde(default)]
    msg: Option<Value>,
    #[serde(default)]
    var: Option<String>,
}

/// Action plugin for printing debug messages and variable values
pub struct DebugAction;

impl DebugAction {
    fn format_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Null => "(undefined)".to_string(),
            _ => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        }
    }

    /// Resolve `a.b.c` against variables first, then facts
    fn lookup(context: &ModuleContext, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let mut current = context.lookup(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current.clone())
    }

    fn render(context: &ModuleContext, template: &str) -> ModuleResult<String> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }
        let mut vars: Map<String, Value> = context
            .facts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.extend(context.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.insert("inventory_hostname".into(), context.host.clone().into());

        Environment::new()
            .render_str(template, Value::Object(vars))
            .map_err(|e| ModuleError::Template(e.to_string()))
    }
}

#[async_trait]
impl ActionPlugin for DebugAction {
    fn name(&self) -> &'static str {
        "debug"
    }

    async fn run(&self, context: &ModuleContext) -> ModuleResult<ModuleReturn> {
        let args: DebugArgs = parse_args(&context.args)?;

        let output = match (args.msg, args.var) {
            (Some(_), Some(_)) => {
                return Err(ModuleError::InvalidParameter(
                    "Cannot specify both 'msg' and 'var' parameters".to_string(),
                ))
            }
            (Some(Value::String(msg)), None) => {
                let msg = Self::render(context, &msg)?;
                ModuleOutput::ok(msg.clone()).with_data("msg", msg.into())
            }
            (Some(other), None) => {
                ModuleOutput::ok(Self::format_value(&other)).with_data("msg", other)
            }
            (None, Some(var)) => match Self::lookup(context, &var) {
                Some(value) => {
                    let msg = format!("{}: {}", var, Self::format_value(&value));
                    ModuleOutput::ok(msg).with_data(var, value)
                }
                None => ModuleOutput::ok(format!("{}: VARIABLE IS NOT DEFINED!", var))
                    .with_data(var, Value::Null),
            },
            (None, None) => ModuleOutput::ok("Hello world!").with_data("msg", "Hello world!".into()),
        };

        info!(host = %context.host, "{}", output.msg);
        Ok(output.into_map())
    }
}

//! Run command - Execute the tasks in a YAML file
//!
//! The file is either a plain list of tasks or a document with `vars`,
//! `hosts` (inventory variables per host) and `tasks`. Results are printed
//! as JSON lines in file order once the pool has drained.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use convoy::config::Config;
use convoy::executor::{ExecutionContext, Executor, Task, TaskStatus};
use convoy::modules::PluginRegistry;
use convoy::routing::Router;

/// Arguments for the run command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to the tasks file
    pub tasks: PathBuf,

    /// Routing table (YAML) applied before running
    #[arg(long, short = 'r', env = "CONVOY_ROUTING_FILE")]
    pub routing: Option<PathBuf>,

    /// Number of workers
    #[arg(long, short = 'f')]
    pub forks: Option<usize>,

    /// Extra variables (key=value), highest precedence
    #[arg(short = 'e', long = "extra-vars", action = clap::ArgAction::Append)]
    pub extra_vars: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskFile {
    Tasks(Vec<Task>),
    Document {
        #[serde(default)]
        vars: HashMap<String, JsonValue>,
        #[serde(default)]
        hosts: HashMap<String, HashMap<String, JsonValue>>,
        tasks: Vec<Task>,
    },
}

/// Tasks plus the variables they run with
#[derive(Debug, Default)]
struct Workload {
    vars: HashMap<String, JsonValue>,
    hosts: HashMap<String, HashMap<String, JsonValue>>,
    tasks: Vec<Task>,
}

impl Workload {
    fn from_yaml(content: &str) -> Result<Self> {
        let file: TaskFile = serde_yaml::from_str(content).context("Invalid tasks file")?;
        let mut workload = match file {
            TaskFile::Tasks(tasks) => Workload {
                tasks,
                ..Default::default()
            },
            TaskFile::Document { vars, hosts, tasks } => Workload { vars, hosts, tasks },
        };
        for task in &mut workload.tasks {
            if task.host.is_empty() {
                task.host = "localhost".to_string();
            }
        }
        Ok(workload)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tasks file: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    fn context_for(&self, host: &str, config: &Arc<Config>) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(Arc::clone(config));
        ctx.variables = self.vars.clone();
        if let Some(host_vars) = self.hosts.get(host) {
            ctx.host_vars = host_vars.clone();
        }
        ctx
    }
}

fn parse_extra_vars(pairs: &[String]) -> Result<HashMap<String, JsonValue>> {
    let mut vars = HashMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Extra variable '{}' is not key=value", pair);
        };
        let value = serde_yaml::from_str::<JsonValue>(value)
            .unwrap_or_else(|_| JsonValue::String(value.to_string()));
        vars.insert(key.trim().to_string(), value);
    }
    Ok(vars)
}

impl RunArgs {
    /// Execute the run command; returns the process exit code
    pub async fn execute(&self, mut config: Config) -> Result<i32> {
        if let Some(forks) = self.forks {
            config.defaults.forks = forks;
        }
        let config = Arc::new(config);

        let router = Arc::new(Router::new());
        if let Some(path) = self.routing.as_ref().or(config.routing_file.as_ref()) {
            router
                .load_config_from_file(path)
                .with_context(|| format!("Failed to load routing file: {}", path.display()))?;
            router.validate_config()?;
            debug!(path = %path.display(), "Loaded routing table");
        }

        let mut workload = Workload::from_file(&self.tasks)?;
        workload.vars.extend(parse_extra_vars(&self.extra_vars)?);
        info!(tasks = workload.tasks.len(), "Loaded tasks");

        let executor = Executor::builder()
            .config(Arc::clone(&config))
            .router(router)
            .plugins(Arc::new(PluginRegistry::with_builtins()))
            .build();
        executor.start()?;

        let mut ids = Vec::with_capacity(workload.tasks.len());
        for task in &workload.tasks {
            ids.push(task.id.clone());
            let ctx = workload.context_for(&task.host, &config);
            executor.queue_task(task.clone(), ctx).await?;
        }
        executor.wait_idle().await;
        executor.stop().await;

        let mut failed = false;
        for id in &ids {
            if let Some(result) = executor.get_result(id) {
                failed |= result.status == TaskStatus::Failed;
                println!("{}", serde_json::to_string(&result)?);
            }
        }
        Ok(if failed { 2 } else { 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_task_list() {
        let workload = Workload::from_yaml("- module: ping\n- module: command\n  host: web1\n  args: {cmd: uptime}\n").unwrap();
        assert_eq!(workload.tasks.len(), 2);
        assert_eq!(workload.tasks[0].host, "localhost");
        assert_eq!(workload.tasks[1].host, "web1");
    }

    #[test]
    fn test_document_with_host_vars() {
        let yaml = r#"
vars:
  env: prod
hosts:
  web1:
    ansible_port: 2222
tasks:
  - module: ping
    host: web1
"#;
        let workload = Workload::from_yaml(yaml).unwrap();
        let ctx = workload.context_for("web1", &Arc::new(Config::default()));
        assert_eq!(ctx.variables["env"], json!("prod"));
        assert_eq!(ctx.connection_config("web1").port, 2222);
    }

    #[test]
    fn test_extra_vars() {
        let vars = parse_extra_vars(&["count=3".into(), "name=web".into()]).unwrap();
        assert_eq!(vars["count"], json!(3));
        assert_eq!(vars["name"], json!("web"));
        assert!(parse_extra_vars(&["broken".into()]).is_err());
    }
}

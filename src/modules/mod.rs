//! Module and action plugin system
//!
//! This module provides the contract between the executor and the units of
//! work it runs. A unit is either a [`Module`] (runs against the target host,
//! usually through a [`Connection`]) or an [`ActionPlugin`] (runs on the
//! control node). Both receive a [`ModuleContext`] and return a JSON map; the
//! executor inspects the `changed` and `failed` keys of that map.
//!
//! Units are looked up by name through the [`PluginManager`] trait. The
//! default implementation, [`PluginRegistry`], maps names to factory
//! closures registered at startup.

pub mod command;
pub mod debug;
pub mod ping;
pub mod shell;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::config::Config;
use crate::connection::{
    BecomeMethod, CommandResult, Connection, ConnectionConfig, ConnectionError, ConnectionManager,
};

/// Errors that can occur during module execution
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Command failed with exit code {code}: {message}")]
    CommandFailed { code: i32, message: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl ModuleError {
    /// Whether the failure was a transport timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModuleError::Connection(e) if e.is_timeout())
    }
}

/// Result type for module operations
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Errors raised while loading a unit by name
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("No module or action plugin named '{0}'")]
    NotFound(String),

    #[error("No action plugin named '{0}'")]
    ActionNotFound(String),
}

/// Arguments passed to a unit
pub type ModuleParams = Map<String, Value>;

/// Result map returned by a unit
pub type ModuleReturn = Map<String, Value>;

/// Convert loosely typed arguments into a unit's own argument struct
pub fn parse_args<T: DeserializeOwned>(params: &ModuleParams) -> ModuleResult<T> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| ModuleError::InvalidParameter(e.to_string()))
}

/// Builder for a unit's result map
#[derive(Debug, Clone, Default)]
pub struct ModuleOutput {
    pub changed: bool,
    pub failed: bool,
    pub msg: String,
    pub data: Map<String, Value>,
}

impl ModuleOutput {
    /// Successful result, nothing changed
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            ..Default::default()
        }
    }

    /// Successful result that changed the target
    pub fn changed(msg: impl Into<String>) -> Self {
        Self {
            changed: true,
            msg: msg.into(),
            ..Default::default()
        }
    }

    /// Failed result
    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            failed: true,
            msg: msg.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Attach `rc`, `stdout`, `stderr` and their line splits
    pub fn with_command_output(mut self, output: &CommandResult) -> Self {
        let lines = |s: &str| Value::from(s.lines().map(str::to_string).collect::<Vec<_>>());
        self.data.insert("rc".into(), output.exit_code.into());
        self.data.insert("stdout".into(), output.stdout.clone().into());
        self.data.insert("stderr".into(), output.stderr.clone().into());
        self.data.insert("stdout_lines".into(), lines(&output.stdout));
        self.data.insert("stderr_lines".into(), lines(&output.stderr));
        self
    }

    /// Flatten into the map handed back to the executor
    pub fn into_map(self) -> ModuleReturn {
        let mut map = self.data;
        map.insert("changed".into(), Value::Bool(self.changed));
        if self.failed {
            map.insert("failed".into(), Value::Bool(true));
        }
        if !self.msg.is_empty() {
            map.insert("msg".into(), Value::String(self.msg));
        }
        map
    }
}

/// Everything a unit needs for one invocation
#[derive(Clone)]
pub struct ModuleContext {
    /// Task arguments
    pub args: ModuleParams,
    /// Merged variables visible to the task
    pub variables: HashMap<String, Value>,
    /// Facts gathered about the target
    pub facts: HashMap<String, Value>,
    /// Global configuration
    pub config: Arc<Config>,
    /// Target host
    pub host: String,
    /// Requested transport ("smart", "local", "ssh", "winrm", ...)
    pub connection_type: String,
    /// Settings used when a new connection has to be opened
    pub connection_config: ConnectionConfig,
    /// Task-level privilege escalation
    pub r#become: bool,
    pub become_method: Option<String>,
    pub become_user: Option<String>,
    /// Shared connection cache
    pub connections: Arc<ConnectionManager>,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("host", &self.host)
            .field("connection_type", &self.connection_type)
            .field("args", &self.args)
            .field("variables", &self.variables.len())
            .field("facts", &self.facts.len())
            .field("become", &self.r#become)
            .field("become_method", &self.become_method)
            .field("become_user", &self.become_user)
            .finish()
    }
}

impl ModuleContext {
    /// Context targeting `host` with default settings
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            args: Map::new(),
            variables: HashMap::new(),
            facts: HashMap::new(),
            config: Arc::new(Config::default()),
            connection_config: ConnectionConfig::new(host.clone()),
            host,
            connection_type: "smart".to_string(),
            r#become: false,
            become_method: None,
            become_user: None,
            connections: Arc::new(ConnectionManager::new()),
        }
    }

    pub fn with_args(mut self, args: ModuleParams) -> Self {
        self.args = args;
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_connection_type(mut self, connection_type: impl Into<String>) -> Self {
        self.connection_type = connection_type.into();
        self
    }

    pub fn with_connections(mut self, connections: Arc<ConnectionManager>) -> Self {
        self.connections = connections;
        self
    }

    /// The cached connection for this context's host, opened on first use
    pub async fn connection(&self) -> ModuleResult<Arc<dyn Connection>> {
        Ok(self
            .connections
            .get_connection(&self.host, &self.connection_type, self.connection_config.clone())
            .await?)
    }

    /// Wrap `command` for task-level privilege escalation.
    ///
    /// Connections configured to escalate already rewrite every command, so
    /// the task-level wrapper only applies when `conn` does not.
    pub fn become_command(&self, conn: &dyn Connection, command: &str) -> String {
        if !self.r#become || conn.base().config().r#become {
            return command.to_string();
        }
        let method = BecomeMethod::parse(self.become_method.as_deref().unwrap_or_default());
        method.wrap(command, self.become_user.as_deref())
    }

    /// Run a command on the target, honoring task-level become
    pub async fn run_command(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> ModuleResult<CommandResult> {
        let conn = self.connection().await?;
        let command = self.become_command(conn.as_ref(), command);
        trace!(host = %self.host, command = %command, "Running command");
        Ok(conn.execute(&command, stdin).await?)
    }

    /// Look up a name in the variables, then the facts
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.variables.get(name).or_else(|| self.facts.get(name))
    }
}

/// A unit that acts on the target host
#[async_trait]
pub trait Module: Send + Sync {
    /// Returns the name of the module
    fn name(&self) -> &'static str;

    /// Returns a description of what the module does
    fn description(&self) -> &'static str {
        ""
    }

    /// Returns the list of required parameters
    fn required_params(&self) -> &[&'static str] {
        &[]
    }

    /// Validate the parameters before execution
    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        for param in self.required_params() {
            if !params.contains_key(*param) {
                return Err(ModuleError::MissingParameter((*param).to_string()));
            }
        }
        Ok(())
    }

    /// Execute the module
    async fn execute(&self, context: &ModuleContext) -> ModuleResult<ModuleReturn>;
}

/// A unit that runs on the control node
#[async_trait]
pub trait ActionPlugin: Send + Sync {
    /// Returns the name of the action
    fn name(&self) -> &'static str;

    /// Run the action
    async fn run(&self, context: &ModuleContext) -> ModuleResult<ModuleReturn>;
}

/// A loaded unit
#[derive(Clone)]
pub enum Plugin {
    Module(Arc<dyn Module>),
    Action(Arc<dyn ActionPlugin>),
}

impl Plugin {
    pub fn name(&self) -> &'static str {
        match self {
            Plugin::Module(m) => m.name(),
            Plugin::Action(a) => a.name(),
        }
    }

    /// "module" or "action"
    pub fn kind(&self) -> &'static str {
        match self {
            Plugin::Module(_) => "module",
            Plugin::Action(_) => "action",
        }
    }

    /// Run the unit's execution entry point
    pub async fn execute(&self, context: &ModuleContext) -> ModuleResult<ModuleReturn> {
        match self {
            Plugin::Module(module) => {
                module.validate_params(&context.args)?;
                module.execute(context).await
            }
            Plugin::Action(action) => action.run(context).await,
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plugin::{}({})", self.kind(), self.name())
    }
}

/// Loads units by resolved name
pub trait PluginManager: Send + Sync {
    /// Load a unit; action plugins shadow modules of the same name
    fn load(&self, name: &str) -> Result<Plugin, PluginError>;

    /// Load an action plugin only
    fn load_action(&self, name: &str) -> Result<Plugin, PluginError>;
}

/// Factory producing a fresh unit instance
pub type PluginFactory = Arc<dyn Fn() -> Plugin + Send + Sync>;

/// Name to factory registry
#[derive(Default)]
pub struct PluginRegistry {
    modules: RwLock<HashMap<String, PluginFactory>>,
    actions: RwLock<HashMap<String, PluginFactory>>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in units
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_module("command", || Arc::new(command::CommandModule));
        registry.register_module("shell", || Arc::new(shell::ShellModule));
        registry.register_module("ping", || Arc::new(ping::PingModule));
        registry.register_action("debug", || Arc::new(debug::DebugAction));
        registry
    }

    /// Register (or replace) a module factory
    pub fn register_module<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Module> + Send + Sync + 'static,
    {
        self.modules
            .write()
            .insert(name.into(), Arc::new(move || Plugin::Module(factory())));
    }

    /// Register (or replace) an action plugin factory
    pub fn register_action<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn ActionPlugin> + Send + Sync + 'static,
    {
        self.actions
            .write()
            .insert(name.into(), Arc::new(move || Plugin::Action(factory())));
    }

    /// Check if a unit exists under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.actions.read().contains_key(name) || self.modules.read().contains_key(name)
    }

    /// All registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .read()
            .keys()
            .chain(self.actions.read().keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl PluginManager for PluginRegistry {
    fn load(&self, name: &str) -> Result<Plugin, PluginError> {
        if let Some(factory) = self.actions.read().get(name) {
            return Ok(factory());
        }
        self.modules
            .read()
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    fn load_action(&self, name: &str) -> Result<Plugin, PluginError> {
        self.actions
            .read()
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PluginError::ActionNotFound(name.to_string()))
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoModule;

    #[async_trait]
    impl Module for EchoModule {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn required_params(&self) -> &[&'static str] {
            &["msg"]
        }

        async fn execute(&self, context: &ModuleContext) -> ModuleResult<ModuleReturn> {
            let msg = context.args["msg"].as_str().unwrap_or_default().to_string();
            Ok(ModuleOutput::changed(msg).into_map())
        }
    }

    struct EchoAction;

    #[async_trait]
    impl ActionPlugin for EchoAction {
        fn name(&self) -> &'static str {
            "echo_action"
        }

        async fn run(&self, _context: &ModuleContext) -> ModuleResult<ModuleReturn> {
            Ok(ModuleOutput::ok("from action").into_map())
        }
    }

    fn args(value: Value) -> ModuleParams {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_registry_builtins() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.contains("command"));
        assert!(registry.contains("debug"));
        assert!(!registry.contains("nonexistent"));
        assert_eq!(registry.names(), vec!["command", "debug", "ping", "shell"]);

        assert_eq!(registry.load("debug").unwrap().kind(), "action");
        assert_eq!(registry.load("shell").unwrap().kind(), "module");
        assert!(matches!(
            registry.load("nope"),
            Err(PluginError::NotFound(name)) if name == "nope"
        ));
        assert!(matches!(
            registry.load_action("shell"),
            Err(PluginError::ActionNotFound(_))
        ));
    }

    #[test]
    fn test_action_shadows_module() {
        let registry = PluginRegistry::new();
        registry.register_module("echo", || Arc::new(EchoModule));
        registry.register_action("echo", || Arc::new(EchoAction));
        assert_eq!(registry.load("echo").unwrap().kind(), "action");
    }

    #[tokio::test]
    async fn test_plugin_execute_validates_params() {
        let plugin = Plugin::Module(Arc::new(EchoModule));

        let ctx = ModuleContext::new("localhost");
        assert!(matches!(
            plugin.execute(&ctx).await,
            Err(ModuleError::MissingParameter(p)) if p == "msg"
        ));

        let ctx = ctx.with_args(args(json!({"msg": "hi"})));
        let result = plugin.execute(&ctx).await.unwrap();
        assert_eq!(result["changed"], json!(true));
        assert_eq!(result["msg"], json!("hi"));
    }

    #[test]
    fn test_module_output_map() {
        let output = CommandResult::new(0, "a\nb\n".into(), String::new(), Default::default());
        let map = ModuleOutput::changed("done")
            .with_command_output(&output)
            .with_data("extra", json!(1))
            .into_map();

        assert_eq!(map["changed"], json!(true));
        assert_eq!(map["rc"], json!(0));
        assert_eq!(map["stdout_lines"], json!(["a", "b"]));
        assert_eq!(map["extra"], json!(1));
        assert!(!map.contains_key("failed"));

        let map = ModuleOutput::failed("boom").into_map();
        assert_eq!(map["failed"], json!(true));
        assert_eq!(map["changed"], json!(false));
    }

    #[test]
    fn test_parse_args() {
        #[derive(serde::Deserialize)]
        struct Args {
            count: u32,
        }
        let parsed: Args = parse_args(&args(json!({"count": 3}))).unwrap();
        assert_eq!(parsed.count, 3);
        assert!(matches!(
            parse_args::<Args>(&args(json!({"count": "x"}))),
            Err(ModuleError::InvalidParameter(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_become_command_only_when_connection_does_not_escalate() {
        let mut ctx = ModuleContext::new("localhost").with_connection_type("local");
        ctx.r#become = true;
        ctx.become_user = Some("root".into());

        let conn = ctx.connection().await.unwrap();
        assert_eq!(ctx.become_command(conn.as_ref(), "id"), "sudo -u root id");

        let escalating = crate::connection::LocalConnection::new(
            ConnectionConfig::new("localhost").with_become("sudo", None),
        );
        assert_eq!(ctx.become_command(&escalating, "id"), "id");
    }
}

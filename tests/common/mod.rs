//! Shared test utilities and fixtures for the Convoy test suite.
//!
//! This module provides:
//! - A mock connection that records commands and keeps a virtual filesystem
//! - A transport registry that hands the created mocks back to the test
//! - Mock modules with scripted behavior
//! - Executor builders wired to the mocks
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use convoy::connection::{
    BaseConnection, CommandResult, Connection, ConnectionConfig, ConnectionError,
    ConnectionFactory, ConnectionManager, ConnectionResult, FileInfo,
};
use convoy::executor::{AlwaysTrue, ConditionEvaluator, Executor, TemplateEvaluator};
use convoy::modules::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleResult, ModuleReturn, PluginRegistry,
};
use convoy::routing::Router;

// ============================================================================
// Mock Connection Implementation
// ============================================================================

/// A mock connection for testing purposes.
///
/// Commands are recorded after privilege escalation has been applied, the
/// same way real transports see them.
#[derive(Debug)]
pub struct MockConnection {
    base: BaseConnection,
    commands: RwLock<Vec<String>>,
    results: RwLock<HashMap<String, CommandResult>>,
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
    fail_connect: bool,
    fail_close: bool,
}

impl MockConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            base: BaseConnection::new(config),
            commands: RwLock::new(Vec::new()),
            results: RwLock::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
            fail_connect: false,
            fail_close: false,
        }
    }

    /// A mock whose `connect` always fails
    pub fn unreachable(config: ConnectionConfig) -> Self {
        Self {
            fail_connect: true,
            ..Self::new(config)
        }
    }

    /// A mock whose `close` disconnects but reports an error
    pub fn stuck(config: ConnectionConfig) -> Self {
        Self {
            fail_close: true,
            ..Self::new(config)
        }
    }

    /// Script the result for an exact (escalated) command line
    pub fn set_result(&self, command: impl Into<String>, result: CommandResult) {
        self.results.write().insert(command.into(), result);
    }

    /// Commands executed so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.read().clone()
    }

    /// Put a file into the virtual filesystem
    pub fn add_file(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.files.write().insert(path.into(), content.into());
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn base(&self) -> &BaseConnection {
        &self.base
    }

    fn connection_type(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> ConnectionResult<()> {
        if self.fail_connect {
            return Err(ConnectionError::ConnectionFailed(format!(
                "{} is unreachable",
                self.host()
            )));
        }
        self.base.set_connected(true);
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.base.set_connected(false);
        if self.fail_close {
            return Err(ConnectionError::ExecutionFailed("close timed out".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        _stdin: Option<&[u8]>,
    ) -> ConnectionResult<CommandResult> {
        self.base.ensure_connected()?;
        let command = self.apply_become(command);
        self.commands.write().push(command.clone());
        Ok(self.results.read().get(&command).cloned().unwrap_or_else(|| {
            CommandResult::new(0, format!("ran: {}\n", command), String::new(), Duration::ZERO)
        }))
    }

    async fn put_file(&self, local_path: &Path, remote_path: &Path) -> ConnectionResult<()> {
        self.base.ensure_connected()?;
        let content = std::fs::read(local_path)?;
        self.files.write().insert(remote_path.to_path_buf(), content);
        Ok(())
    }

    async fn get_file(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()> {
        self.base.ensure_connected()?;
        let content = self
            .files
            .read()
            .get(remote_path)
            .cloned()
            .ok_or_else(|| ConnectionError::TransferFailed(remote_path.display().to_string()))?;
        std::fs::write(local_path, content)?;
        Ok(())
    }

    async fn file_exists(&self, path: &Path) -> ConnectionResult<bool> {
        self.base.ensure_connected()?;
        Ok(self.files.read().contains_key(path))
    }

    async fn create_directory(&self, path: &Path, _mode: u32) -> ConnectionResult<()> {
        self.base.ensure_connected()?;
        self.files.write().insert(path.to_path_buf(), Vec::new());
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> ConnectionResult<()> {
        self.base.ensure_connected()?;
        self.files.write().remove(path);
        Ok(())
    }

    async fn get_file_info(&self, path: &Path) -> ConnectionResult<FileInfo> {
        self.base.ensure_connected()?;
        let files = self.files.read();
        let content = files
            .get(path)
            .ok_or_else(|| ConnectionError::ExecutionFailed(format!("{}: not found", path.display())))?;
        Ok(FileInfo {
            size: content.len() as u64,
            mode: 0o644,
            ..Default::default()
        })
    }
}

/// Keeps every mock the factory creates so tests can inspect them
#[derive(Clone, Default)]
pub struct MockTransport {
    created: Arc<RwLock<Vec<Arc<MockConnection>>>>,
    scripted: Arc<RwLock<HashMap<String, CommandResult>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a result on every mock created from now on
    pub fn set_result(&self, command: impl Into<String>, result: CommandResult) {
        self.scripted.write().insert(command.into(), result);
    }

    /// Register the "mock" transport, an always failing "down" one, and a
    /// "stuck" one whose close errors
    pub fn register(&self, factory: &ConnectionFactory) {
        let transport = self.clone();
        factory.register("mock", move |config| {
            let conn = Arc::new(MockConnection::new(config));
            for (command, result) in transport.scripted.read().iter() {
                conn.set_result(command.clone(), result.clone());
            }
            transport.created.write().push(Arc::clone(&conn));
            Ok(conn as Arc<dyn Connection>)
        });
        factory.register("down", |config| {
            Ok(Arc::new(MockConnection::unreachable(config)) as Arc<dyn Connection>)
        });
        let transport = self.clone();
        factory.register("stuck", move |config| {
            let conn = Arc::new(MockConnection::stuck(config));
            transport.created.write().push(Arc::clone(&conn));
            Ok(conn as Arc<dyn Connection>)
        });
    }

    /// A connection manager with the mock transports registered
    pub fn manager(&self) -> Arc<ConnectionManager> {
        let factory = ConnectionFactory::new();
        self.register(&factory);
        Arc::new(ConnectionManager::with_factory(factory))
    }

    pub fn created(&self) -> Vec<Arc<MockConnection>> {
        self.created.read().clone()
    }

    /// Every command run on any mock
    pub fn commands(&self) -> Vec<String> {
        self.created().iter().flat_map(|c| c.commands()).collect()
    }
}

// ============================================================================
// Mock Modules
// ============================================================================

/// Counts calls; errors until `succeed_on` calls have been made (never when 0)
pub struct CountingModule {
    pub calls: Arc<AtomicU32>,
    pub succeed_on: u32,
}

#[async_trait]
impl Module for CountingModule {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn execute(&self, _context: &ModuleContext) -> ModuleResult<ModuleReturn> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.succeed_on != 0 && call >= self.succeed_on {
            Ok(ModuleOutput::changed(format!("succeeded on call {}", call)).into_map())
        } else {
            Err(ModuleError::ExecutionFailed(format!("call {} failed", call)))
        }
    }
}

/// Returns whatever map it was given under the `output` argument
pub struct ScriptedModule {
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl Module for ScriptedModule {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, context: &ModuleContext) -> ModuleResult<ModuleReturn> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match context.args.get("output") {
            Some(Value::Object(map)) => Ok(map.clone()),
            _ => Ok(ModuleOutput::ok("").into_map()),
        }
    }
}

/// Counters shared with the registered mock modules
#[derive(Clone, Default)]
pub struct Calls {
    pub counting: Arc<AtomicU32>,
    pub scripted: Arc<AtomicU32>,
}

impl Calls {
    pub fn counting(&self) -> u32 {
        self.counting.load(Ordering::SeqCst)
    }

    pub fn scripted(&self) -> u32 {
        self.scripted.load(Ordering::SeqCst)
    }
}

/// Built-in units plus `counting` (never succeeds), `eventually` (succeeds
/// on the third call) and `scripted`
pub fn registry(calls: &Calls) -> PluginRegistry {
    let registry = PluginRegistry::with_builtins();
    let counting = Arc::clone(&calls.counting);
    registry.register_module("counting", move || {
        Arc::new(CountingModule {
            calls: Arc::clone(&counting),
            succeed_on: 0,
        })
    });
    let eventually = Arc::clone(&calls.counting);
    registry.register_module("eventually", move || {
        Arc::new(CountingModule {
            calls: Arc::clone(&eventually),
            succeed_on: 3,
        })
    });
    let scripted = Arc::clone(&calls.scripted);
    registry.register_module("scripted", move || {
        Arc::new(ScriptedModule {
            calls: Arc::clone(&scripted),
        })
    });
    registry
}

/// Everything a test needs to drive an executor against mocks
pub struct Harness {
    pub executor: Executor,
    pub calls: Calls,
    pub transport: MockTransport,
}

/// An executor with mock units and transports, using `evaluator`
pub fn harness_with(evaluator: Arc<dyn ConditionEvaluator>) -> Harness {
    let calls = Calls::default();
    let transport = MockTransport::new();
    let executor = Executor::builder()
        .router(Arc::new(Router::new()))
        .plugins(Arc::new(registry(&calls)))
        .connections(transport.manager())
        .evaluator(evaluator)
        .build();
    Harness {
        executor,
        calls,
        transport,
    }
}

/// An executor with mock units and transports and real guard evaluation
pub fn harness() -> Harness {
    harness_with(Arc::new(TemplateEvaluator::new()))
}

/// An executor whose guards are always true
pub fn permissive_harness() -> Harness {
    harness_with(Arc::new(AlwaysTrue))
}

/// Build a JSON object map from a `json!` literal
pub fn map(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

//! # Convoy - Concurrent task fan-out for configuration management
//!
//! Convoy is the control-node engine of an Ansible-style automation tool. It
//! takes tasks (a module name, arguments and guard expressions bound to one
//! host) and runs them on a fixed-size worker pool over pluggable transports,
//! with retry, conditional-skip and privilege-escalation semantics.
//!
//! ## Core Concepts
//!
//! - **Tasks**: One module invocation on one host, with `when`,
//!   `changed_when`, `failed_when`, retries and timeouts
//! - **Executor**: Worker pool, queue, per-task lifecycle and result store
//! - **Router**: Resolves module names through redirects and reports
//!   deprecations
//! - **Plugins**: Modules (run against the host) and action plugins (run on
//!   the control node), looked up through a [`PluginManager`](modules::PluginManager)
//! - **Connections**: Local, SSH and WinRM transports behind one trait, with
//!   privilege escalation
//!
//! ## Architecture Overview
//!
//! ```text
//! queue_task ──> dispatcher ──> idle worker ──> Executor::execute_task
//!                                                  │
//!                      Router::resolve_module <────┤
//!                      PluginManager::load    <────┤
//!                      ConditionEvaluator     <────┤
//!                                                  ▼
//!                                       Module / ActionPlugin
//!                                                  │
//!                                                  ▼
//!                                  ConnectionManager (local, ssh, winrm)
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use convoy::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let executor = Executor::new(
//!         Arc::new(Router::new()),
//!         Arc::new(PluginRegistry::with_builtins()),
//!     );
//!
//!     let task = Task::new("command", "localhost").arg("cmd", "uptime");
//!     let result = executor
//!         .execute_task(&task, &ExecutionContext::default())
//!         .await?;
//!     println!("{}", result.result["stdout"]);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    // Connection types
    pub use crate::connection::{
        CommandResult, Connection, ConnectionConfig, ConnectionError, ConnectionFactory,
        ConnectionManager, ConnectionResult, ConnectionType, LocalConnection,
    };

    // Error handling
    pub use crate::error::{Error, Result};

    // Execution engine
    pub use crate::executor::{
        ConditionEvaluator, ExecutionContext, Executor, Task, TaskError, TaskResult, TaskStatus,
        TemplateEvaluator,
    };

    // Module system
    pub use crate::modules::{
        ActionPlugin, Module, ModuleContext, ModuleOutput, ModuleResult, Plugin, PluginManager,
        PluginRegistry,
    };

    // Routing
    pub use crate::routing::{ModuleRouting, PluginType, Router, RuntimeConfig};

    // Configuration
    pub use crate::config::Config;
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and result aliases for Convoy operations.
pub mod error;

/// Configuration management for Convoy behavior.
///
/// Handles loading and merging configuration from TOML files and
/// `CONVOY_*` environment variables.
pub mod config;

// ============================================================================
// Execution
// ============================================================================

/// Task execution engine: worker pool, task lifecycle, retries and guards.
pub mod executor;

/// Module name resolution through redirect tables.
pub mod routing;

/// Modules, action plugins and the registry that loads them.
pub mod modules;

// ============================================================================
// Transport
// ============================================================================

/// Connection abstraction for local, SSH and WinRM transports.
///
/// # Connection Types
///
/// - [`LocalConnection`](connection::LocalConnection): Execute on the control node
/// - [`SshConnection`](connection::SshConnection): Pure Rust SSH via russh
/// - [`WinRmConnection`](connection::WinRmConnection): Windows Remote Management
pub mod connection;

// ============================================================================
// Version Information
// ============================================================================

/// Returns the current version of Convoy.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

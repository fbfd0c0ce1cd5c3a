//! Error types for Convoy.
//!
//! Each layer owns its own error enum; this module folds them into the
//! crate-wide [`Error`] for callers that do not care which layer failed.

use thiserror::Error;

use crate::connection::ConnectionError;
use crate::executor::{ConditionError, ExecutorError, TaskError};
use crate::modules::{ModuleError, PluginError};
use crate::routing::RouterError;

/// Result type alias for Convoy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Convoy.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Layer Errors
    // ========================================================================
    /// Transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Name resolution or routing table failure.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Unit lookup failure.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Unit execution failure.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Guard expression failure.
    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// Engine failure.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// A task finished as failed.
    #[error(transparent)]
    Task(#[from] TaskError),

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}

impl Error {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Connection(e) => e.is_timeout(),
            Error::Module(e) => e.is_timeout(),
            Error::Executor(e) => matches!(e, ExecutorError::Timeout { .. }),
            Error::Task(e) => matches!(e.source, ExecutorError::Timeout { .. }),
            _ => false,
        }
    }

    /// Returns the error code for CLI exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Task(_) | Error::Module(_) | Error::Executor(_) => 2,
            Error::Connection(_) => 3,
            Error::Router(_) | Error::Plugin(_) | Error::Condition(_) => 4,
            _ => 1,
        }
    }
}

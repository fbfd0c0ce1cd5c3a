//! Task definition and task results
//!
//! This module provides:
//! - Task struct with module, args, guard expressions and retry settings
//! - Task result with its status state machine

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Status of a task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Recorded, not started yet
    #[default]
    Pending,
    /// An attempt is in progress
    Running,
    /// Finished successfully
    Completed,
    /// Finished with a failure
    Failed,
    /// Guard evaluated false
    Skipped,
}

impl TaskStatus {
    /// Completed, failed and skipped are final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durations given either as seconds or as humantime text ("1m 30s")
mod flexible_duration {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Seconds(secs)) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid duration: {} seconds: {}", secs, e))),
            Some(Raw::Text(text)) => humantime_serde::re::humantime::parse_duration(&text)
                .map(Some)
                .map_err(D::Error::custom),
        }
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime_serde::serialize(value, serializer)
    }
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A task to be executed against one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier; results are stored under it
    #[serde(default = "new_task_id")]
    pub id: String,
    /// Task name (displayed during execution, run-once key)
    #[serde(default)]
    pub name: String,
    /// Target host
    #[serde(default)]
    pub host: String,
    /// Module to execute
    pub module: String,
    /// Module arguments
    #[serde(default)]
    pub args: Map<String, JsonValue>,
    /// Guard expression; false skips the task
    #[serde(default)]
    pub when: Option<String>,
    /// Overrides the unit's `changed` flag
    #[serde(default)]
    pub changed_when: Option<String>,
    /// Marks the task failed when true
    #[serde(default)]
    pub failed_when: Option<String>,
    /// Number of attempts (0 and 1 both mean one)
    #[serde(default)]
    pub retries: u32,
    /// Pause between attempts
    #[serde(default, with = "flexible_duration")]
    pub delay: Option<Duration>,
    /// Per-attempt time limit
    #[serde(default, with = "flexible_duration")]
    pub timeout: Option<Duration>,
    /// Report unit failures without failing the run
    #[serde(default)]
    pub ignore_errors: bool,
    /// Run on the first host only
    #[serde(default)]
    pub run_once: bool,
    /// Upper bound for an asynchronous run
    #[serde(default, rename = "async", with = "flexible_duration")]
    pub async_timeout: Option<Duration>,
    /// Poll interval for asynchronous runs; zero runs in the background
    #[serde(default, with = "flexible_duration")]
    pub poll: Option<Duration>,
    /// Task-level privilege escalation
    #[serde(default, rename = "become")]
    pub r#become: Option<bool>,
    #[serde(default)]
    pub become_method: Option<String>,
    #[serde(default)]
    pub become_user: Option<String>,
    /// Transport override
    #[serde(default)]
    pub connection: Option<String>,
    /// Task variables, highest precedence
    #[serde(default)]
    pub vars: HashMap<String, JsonValue>,
}

impl Task {
    /// Create a new task running `module` on `host`
    pub fn new(module: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: new_task_id(),
            name: String::new(),
            host: host.into(),
            module: module.into(),
            args: Map::new(),
            when: None,
            changed_when: None,
            failed_when: None,
            retries: 0,
            delay: None,
            timeout: None,
            ignore_errors: false,
            run_once: false,
            async_timeout: None,
            poll: None,
            r#become: None,
            become_method: None,
            become_user: None,
            connection: None,
            vars: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a module argument
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.when = Some(condition.into());
        self
    }

    pub fn changed_when(mut self, condition: impl Into<String>) -> Self {
        self.changed_when = Some(condition.into());
        self
    }

    pub fn failed_when(mut self, condition: impl Into<String>) -> Self {
        self.failed_when = Some(condition.into());
        self
    }

    pub fn retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.delay = Some(delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    pub fn run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    /// Run asynchronously with an upper bound and poll interval
    pub fn async_run(mut self, limit: Duration, poll: Duration) -> Self {
        self.async_timeout = Some(limit);
        self.poll = Some(poll);
        self
    }

    pub fn r#become(mut self, method: impl Into<String>, user: Option<String>) -> Self {
        self.r#become = Some(true);
        self.become_method = Some(method.into());
        self.become_user = user;
        self
    }

    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Name for display and run-once bookkeeping
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.module
        } else {
            &self.name
        }
    }

    /// Total number of attempts
    pub fn attempts(&self) -> u32 {
        self.retries.max(1)
    }

    /// Runs detached from the caller (async with poll 0)
    pub fn is_background(&self) -> bool {
        self.async_timeout.map_or(false, |t| !t.is_zero())
            && self.poll.map_or(false, |p| p.is_zero())
    }

    /// Time limit for a single attempt, the tighter of timeout and async
    pub fn attempt_limit(&self) -> Option<Duration> {
        let limits = [self.timeout, self.async_timeout];
        limits
            .into_iter()
            .flatten()
            .filter(|d| !d.is_zero())
            .min()
    }
}

/// Result of executing a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub host: String,
    pub status: TaskStatus,
    pub changed: bool,
    pub failed: bool,
    #[serde(default)]
    pub message: String,
    /// Raw map returned by the unit
    #[serde(default)]
    pub result: JsonValue,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde", default)]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Deprecation and other non-fatal notices
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Attempts made so far
    #[serde(default)]
    pub attempts: u32,
}

impl TaskResult {
    /// A pending result for `task`
    pub fn pending(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            host: task.host.clone(),
            status: TaskStatus::Pending,
            changed: false,
            failed: false,
            message: String::new(),
            result: JsonValue::Null,
            start_time: Utc::now(),
            end_time: None,
            duration: Duration::ZERO,
            error: None,
            warnings: Vec::new(),
            attempts: 0,
        }
    }

    /// Start an attempt; ignored once terminal
    pub fn start_attempt(&mut self, attempt: u32) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Running;
            self.attempts = attempt;
        }
    }

    /// Finish successfully
    pub fn complete(&mut self, message: impl Into<String>) {
        self.finish(TaskStatus::Completed, message.into());
    }

    /// Finish as failed with an error
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let error = error.into();
        self.failed = true;
        self.error = Some(error.clone());
        self.finish(TaskStatus::Failed, error);
    }

    /// Finish as skipped
    pub fn skip(&mut self, message: impl Into<String>) {
        self.finish(TaskStatus::Skipped, message.into());
    }

    fn finish(&mut self, status: TaskStatus, message: String) {
        if self.status.is_terminal() {
            return;
        }
        let end = Utc::now();
        self.status = status;
        if !message.is_empty() {
            self.message = message;
        }
        self.duration = (end - self.start_time).to_std().unwrap_or_default();
        self.end_time = Some(end);
    }

    /// Ended without an error
    pub fn is_ok(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Skipped) && !self.failed
    }
}

//! Core execution engine for Convoy
//!
//! This module provides the task execution engine with:
//! - A fixed-size worker pool fed from one bounded queue
//! - A dispatcher handing queued tasks to idle worker inboxes
//! - A result collector that stores results and broadcasts them
//! - Per-task resolution, guards, retries, timeouts and background jobs

pub mod condition;
pub mod context;
pub mod task;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::modules::{ModuleContext, ModuleReturn, Plugin, PluginError, PluginManager, PluginRegistry};
use crate::routing::{Router, RouterError};

pub use condition::{AlwaysTrue, ConditionError, ConditionEvaluator, TemplateEvaluator};
pub use context::ExecutionContext;
pub use task::{Task, TaskResult, TaskStatus};

/// Errors that can occur during execution
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to resolve module: {0}")]
    Resolution(#[from] RouterError),

    #[error("Failed to load module: {0}")]
    Load(#[from] PluginError),

    #[error("Failed to evaluate {clause} condition: {source}")]
    Condition {
        clause: &'static str,
        #[source]
        source: ConditionError,
    },

    #[error("Task failed after {attempts} attempt(s): {message}")]
    Execution { attempts: u32, message: String },

    #[error("Task timed out after {limit:?} on attempt {attempts}")]
    Timeout { attempts: u32, limit: Duration },

    #[error("Module reported failure: {0}")]
    ModuleFailed(String),

    #[error("failed_when condition matched: {0}")]
    FailedWhen(String),

    #[error("Executor was stopped")]
    Cancelled,

    #[error("Executor is not running")]
    NotRunning,

    #[error("Executor is already running")]
    AlreadyRunning,
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// A failed task: the populated result plus the cause
#[derive(Error, Debug)]
#[error("Task {} on {} failed: {source}", .result.task_id, .result.host)]
pub struct TaskError {
    pub result: Box<TaskResult>,
    #[source]
    pub source: ExecutorError,
}

/// Outcome of one task
pub type TaskOutcome = Result<TaskResult, TaskError>;

/// A task waiting in the queue
struct Job {
    task: Task,
    context: ExecutionContext,
}

type Inbox = mpsc::Sender<Job>;

/// Handles of a running pool
struct Pool {
    queue: mpsc::Sender<Job>,
    handles: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

struct Inner {
    router: Arc<Router>,
    plugins: Arc<dyn PluginManager>,
    connections: Arc<ConnectionManager>,
    evaluator: Arc<dyn ConditionEvaluator>,
    config: Arc<Config>,
    results: RwLock<HashMap<String, TaskResult>>,
    /// Task name to (host, task id) of the first run
    run_once: Mutex<HashMap<String, (String, String)>>,
    max_workers: AtomicUsize,
    events: broadcast::Sender<TaskResult>,
    in_flight: AtomicUsize,
    idle: Notify,
    cancel: Mutex<CancellationToken>,
    pool: Mutex<Option<Pool>>,
}

/// The task execution engine
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

/// Builder for [`Executor`]
pub struct ExecutorBuilder {
    router: Option<Arc<Router>>,
    plugins: Option<Arc<dyn PluginManager>>,
    connections: Option<Arc<ConnectionManager>>,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
    config: Arc<Config>,
}

impl ExecutorBuilder {
    pub fn router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn plugins(mut self, plugins: Arc<dyn PluginManager>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn connections(mut self, connections: Arc<ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = config;
        self
    }

    /// Build the executor; unset collaborators get their defaults
    pub fn build(self) -> Executor {
        let (events, _) = broadcast::channel(self.config.defaults.queue_capacity.max(16));
        let inner = Inner {
            router: self.router.unwrap_or_default(),
            plugins: self
                .plugins
                .unwrap_or_else(|| Arc::new(PluginRegistry::with_builtins())),
            connections: self.connections.unwrap_or_default(),
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Arc::new(TemplateEvaluator::new())),
            max_workers: AtomicUsize::new(self.config.defaults.forks.max(1)),
            config: self.config,
            results: RwLock::new(HashMap::new()),
            run_once: Mutex::new(HashMap::new()),
            events,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            cancel: Mutex::new(CancellationToken::new()),
            pool: Mutex::new(None),
        };
        Executor {
            inner: Arc::new(inner),
        }
    }
}

impl Executor {
    /// Create an executor around a router and a plugin manager
    pub fn new(router: Arc<Router>, plugins: Arc<dyn PluginManager>) -> Self {
        Self::builder().router(router).plugins(plugins).build()
    }

    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder {
            router: None,
            plugins: None,
            connections: None,
            evaluator: None,
            config: Arc::new(Config::default()),
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.inner.connections
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    /// Worker count used by the next `start`
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers.load(Ordering::SeqCst)
    }

    /// Change the worker count; takes effect on the next `start`
    pub fn set_max_workers(&self, workers: usize) {
        self.inner.max_workers.store(workers.max(1), Ordering::SeqCst);
    }

    /// Whether the pool is running
    pub fn is_running(&self) -> bool {
        self.inner.pool.lock().is_some()
    }

    /// Result stored for `task_id`
    pub fn get_result(&self, task_id: &str) -> Option<TaskResult> {
        self.inner.results.read().get(task_id).cloned()
    }

    /// Snapshot of every stored result
    pub fn results(&self) -> HashMap<String, TaskResult> {
        self.inner.results.read().clone()
    }

    /// Receive every result folded in by the collector
    pub fn subscribe(&self) -> broadcast::Receiver<TaskResult> {
        self.inner.events.subscribe()
    }

    /// Run one task to completion on the calling task
    pub async fn execute_task(&self, task: &Task, ctx: &ExecutionContext) -> TaskOutcome {
        self.inner.execute_task(task, ctx).await
    }

    /// Spawn the workers, the dispatcher and the result collector.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> ExecutorResult<()> {
        let mut pool = self.inner.pool.lock();
        if pool.is_some() {
            return Err(ExecutorError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *self.inner.cancel.lock() = token.clone();

        let workers = self.max_workers();
        let capacity = self.inner.config.defaults.queue_capacity.max(1);
        let (queue_tx, queue_rx) = mpsc::channel::<Job>(capacity);
        let (idle_tx, idle_rx) = mpsc::channel::<Inbox>(workers);
        let (result_tx, result_rx) = mpsc::channel::<TaskResult>(workers * 2);

        let mut handles = Vec::with_capacity(workers + 2);
        for id in 0..workers {
            handles.push(tokio::spawn(worker(
                id,
                Arc::clone(&self.inner),
                idle_tx.clone(),
                result_tx.clone(),
                token.clone(),
            )));
        }
        drop(idle_tx);
        drop(result_tx);
        handles.push(tokio::spawn(dispatch(queue_rx, idle_rx, token.clone())));
        handles.push(tokio::spawn(collect(Arc::clone(&self.inner), result_rx)));

        info!(workers, capacity, "Executor started");
        *pool = Some(Pool {
            queue: queue_tx,
            handles,
            token,
        });
        Ok(())
    }

    /// Enqueue a task, giving up if the executor is stopped meanwhile
    pub async fn queue_task(&self, task: Task, context: ExecutionContext) -> ExecutorResult<()> {
        let (queue, token) = {
            let pool = self.inner.pool.lock();
            match pool.as_ref() {
                Some(pool) => (pool.queue.clone(), pool.token.clone()),
                None => return Err(ExecutorError::NotRunning),
            }
        };

        debug!(task_id = %task.id, host = %task.host, "Queueing task");
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let sent = tokio::select! {
            _ = token.cancelled() => Err(ExecutorError::Cancelled),
            sent = queue.send(Job { task, context }) => sent.map_err(|_| ExecutorError::NotRunning),
        };
        if sent.is_err() {
            self.inner.release_slot();
        }
        sent
    }

    /// Wait until every queued task has produced a result, or the
    /// executor is stopped
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let token = self.inner.token();
            tokio::select! {
                _ = notified => {}
                _ = token.cancelled() => return,
            }
        }
    }

    /// Cancel in-flight work, close the queue and join the pool
    pub async fn stop(&self) {
        let Some(pool) = self.inner.pool.lock().take() else {
            return;
        };

        info!("Stopping executor");
        pool.token.cancel();
        drop(pool.queue);
        for handle in pool.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Executor task ended abnormally");
            }
        }

        self.inner.in_flight.store(0, Ordering::SeqCst);
        self.inner.idle.notify_waiters();
        self.inner.connections.close_all_connections().await;
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("max_workers", &self.max_workers())
            .field("running", &self.is_running())
            .field("results", &self.inner.results.read().len())
            .finish()
    }
}

async fn worker(
    id: usize,
    inner: Arc<Inner>,
    idle: mpsc::Sender<Inbox>,
    results: mpsc::Sender<TaskResult>,
    token: CancellationToken,
) {
    let (inbox_tx, mut inbox) = mpsc::channel::<Job>(1);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            registered = idle.send(inbox_tx.clone()) => {
                if registered.is_err() {
                    break;
                }
            }
        }

        let job = tokio::select! {
            _ = token.cancelled() => break,
            job = inbox.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let result = match inner.execute_task(&job.task, &job.context).await {
            Ok(result) => result,
            Err(e) => *e.result,
        };
        if results.send(result).await.is_err() {
            break;
        }
    }
    debug!(worker = id, "Worker stopped");
}

async fn dispatch(
    mut queue: mpsc::Receiver<Job>,
    mut idle: mpsc::Receiver<Inbox>,
    token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = token.cancelled() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let inbox = tokio::select! {
            _ = token.cancelled() => break,
            inbox = idle.recv() => match inbox {
                Some(inbox) => inbox,
                None => break,
            },
        };
        if let Err(e) = inbox.send(job).await {
            warn!(task_id = %e.0.task.id, "Worker went away, dropping task");
        }
    }
    debug!("Dispatcher stopped");
}

async fn collect(inner: Arc<Inner>, mut results: mpsc::Receiver<TaskResult>) {
    while let Some(result) = results.recv().await {
        inner.store(&result);
        // No subscribers is fine.
        let _ = inner.events.send(result);
        inner.release_slot();
    }
    debug!("Result collector stopped");
}

/// Await `fut`, bounded by `limit` when set
async fn within<F: Future>(fut: F, limit: Option<Duration>) -> Result<F::Output, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
        None => Ok(fut.await),
    }
}

impl Inner {
    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn store(&self, result: &TaskResult) {
        self.results
            .write()
            .insert(result.task_id.clone(), result.clone());
    }

    fn release_slot(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    fn fail(&self, mut result: TaskResult, error: ExecutorError) -> TaskOutcome {
        warn!(task_id = %result.task_id, host = %result.host, error = %error, "Task failed");
        result.fail(error.to_string());
        self.store(&result);
        Err(TaskError {
            result: Box::new(result),
            source: error,
        })
    }

    fn finish(&self, result: TaskResult) -> TaskOutcome {
        self.store(&result);
        Ok(result)
    }

    /// Load the unit for `requested`, honoring an action plugin override
    fn load(&self, requested: &str, resolved: &str) -> ExecutorResult<Plugin> {
        let plugin = match self.router.get_module_action_plugin(requested) {
            Some(action) => self.plugins.load_action(&action)?,
            None => self.plugins.load(resolved)?,
        };
        Ok(plugin)
    }

    /// Record a run-once claim; returns the earlier claim if there is one
    fn claim_run_once(&self, task: &Task) -> Option<(String, String)> {
        let mut claims = self.run_once.lock();
        match claims.get(task.display_name()) {
            Some(first) => Some(first.clone()),
            None => {
                claims.insert(
                    task.display_name().to_string(),
                    (task.host.clone(), task.id.clone()),
                );
                None
            }
        }
    }

    fn module_context(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        vars: &Map<String, JsonValue>,
    ) -> ModuleContext {
        let escalation = &ctx.config.privilege_escalation;
        let mut module_ctx = ModuleContext::new(task.host.clone())
            .with_args(task.args.clone())
            .with_variables(vars.clone().into_iter().collect())
            .with_connection_type(
                task.connection
                    .clone()
                    .or_else(|| ctx.transport())
                    .unwrap_or_else(|| ctx.config.defaults.transport.clone()),
            )
            .with_connections(Arc::clone(&self.connections));
        module_ctx.facts = ctx.facts.clone();
        module_ctx.config = Arc::clone(&ctx.config);
        module_ctx.connection_config = ctx.connection_config(&task.host);
        module_ctx.r#become = task.r#become.unwrap_or(false);
        module_ctx.become_method = Some(
            task.become_method
                .clone()
                .unwrap_or_else(|| escalation.become_method.clone()),
        );
        module_ctx.become_user = Some(
            task.become_user
                .clone()
                .unwrap_or_else(|| escalation.become_user.clone()),
        );
        module_ctx
    }

    #[instrument(skip(self, task, ctx), fields(task_id = %task.id, host = %task.host, module = %task.module))]
    async fn execute_task(self: &Arc<Self>, task: &Task, ctx: &ExecutionContext) -> TaskOutcome {
        let mut result = TaskResult::pending(task);
        self.store(&result);

        let resolved = match self.router.resolve_module(&task.module) {
            Ok(name) => name,
            Err(e) => return self.fail(result, e.into()),
        };
        if resolved != task.module {
            debug!(resolved = %resolved, "Module redirected");
        }
        if let Some(warning) = self.router.module_deprecation(&task.module) {
            warn!(module = %task.module, "{}", warning);
            result.warnings.push(warning);
        }

        let plugin = match self.load(&task.module, &resolved) {
            Ok(plugin) => plugin,
            Err(e) => return self.fail(result, e),
        };

        let mut vars = ctx.template_vars(&task.host);
        vars.extend(task.vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(expr) = &task.when {
            match self.evaluator.evaluate_boolean(expr, &vars) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(when = %expr, "Skipping task");
                    result.skip(format!("Conditional result was false: {}", expr));
                    return self.finish(result);
                }
                Err(source) => {
                    return self.fail(
                        result,
                        ExecutorError::Condition {
                            clause: "when",
                            source,
                        },
                    )
                }
            }
        }

        if task.run_once {
            if let Some((host, task_id)) = self.claim_run_once(task) {
                let outcome = self
                    .results
                    .read()
                    .get(&task_id)
                    .map(|r| r.status.as_str())
                    .unwrap_or("pending");
                result.result = json!({
                    "run_once_host": host,
                    "run_once_task_id": task_id,
                    "run_once_status": outcome,
                });
                result.skip(format!("run_once: already run on {} ({})", host, outcome));
                return self.finish(result);
            }
        }

        let module_ctx = self.module_context(task, ctx, &vars);

        if task.is_background() {
            let job_id = format!("{}:async", task.id);
            let mut job = TaskResult::pending(task);
            job.task_id = job_id.clone();
            job.warnings = result.warnings.clone();
            self.store(&job);

            let inner = Arc::clone(self);
            let task = task.clone();
            let background_id = job_id.clone();
            tokio::spawn(
                async move {
                    let outcome = inner.run_attempts(&task, &plugin, &module_ctx, &vars, job).await;
                    if let Err(e) = outcome {
                        warn!(job_id = %background_id, error = %e, "Background job failed");
                    }
                }
                .in_current_span(),
            );

            info!(job_id = %job_id, "Started background job");
            result.result = json!({
                "ansible_job_id": job_id,
                "started": 1,
                "finished": 0,
            });
            result.complete("Started background job");
            return self.finish(result);
        }

        self.run_attempts(task, &plugin, &module_ctx, &vars, result)
            .await
    }

    /// The retry loop; each attempt races the engine token and the
    /// per-attempt limit
    async fn run_attempts(
        &self,
        task: &Task,
        plugin: &Plugin,
        module_ctx: &ModuleContext,
        vars: &Map<String, JsonValue>,
        mut result: TaskResult,
    ) -> TaskOutcome {
        let attempts = task.attempts();
        let delay = task
            .delay
            .unwrap_or_else(|| Duration::from_secs(self.config.defaults.retry_delay));
        let limit = task.attempt_limit();
        let token = self.token();

        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > 1 {
                tokio::select! {
                    _ = token.cancelled() => return self.fail(result, ExecutorError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            result.start_attempt(attempt);
            self.store(&result);
            debug!(attempt, attempts, unit = %plugin.name(), "Running attempt");

            let outcome = tokio::select! {
                _ = token.cancelled() => return self.fail(result, ExecutorError::Cancelled),
                outcome = within(plugin.execute(module_ctx), limit) => outcome,
            };

            let error = match outcome {
                Ok(Ok(output)) => return self.settle(task, vars, output, result),
                Ok(Err(e)) if e.is_timeout() => ExecutorError::Timeout {
                    attempts: attempt,
                    limit: module_ctx.connection_config.timeout_duration(),
                },
                Ok(Err(e)) => ExecutorError::Execution {
                    attempts: attempt,
                    message: e.to_string(),
                },
                Err(limit) => ExecutorError::Timeout {
                    attempts: attempt,
                    limit,
                },
            };

            if attempt >= attempts {
                return self.fail(result, error);
            }
            warn!(attempt, attempts, error = %error, "Attempt failed, retrying");
        }
    }

    /// Apply the unit's output and the post-execution guards
    fn settle(
        &self,
        task: &Task,
        vars: &Map<String, JsonValue>,
        output: ModuleReturn,
        mut result: TaskResult,
    ) -> TaskOutcome {
        let flag = |key: &str| output.get(key).and_then(JsonValue::as_bool).unwrap_or(false);
        result.changed = flag("changed");
        let unit_failed = flag("failed");
        let message = output
            .get("msg")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();

        let payload = JsonValue::Object(output);
        let mut guard_vars = vars.clone();
        guard_vars.insert("result".into(), payload.clone());
        result.result = payload;

        if let Some(expr) = &task.changed_when {
            match self.evaluator.evaluate_boolean(expr, &guard_vars) {
                Ok(changed) => result.changed = changed,
                Err(source) => {
                    return self.fail(
                        result,
                        ExecutorError::Condition {
                            clause: "changed_when",
                            source,
                        },
                    )
                }
            }
        }

        if let Some(expr) = &task.failed_when {
            match self.evaluator.evaluate_boolean(expr, &guard_vars) {
                Ok(true) => return self.fail(result, ExecutorError::FailedWhen(expr.clone())),
                Ok(false) => {}
                Err(source) => {
                    return self.fail(
                        result,
                        ExecutorError::Condition {
                            clause: "failed_when",
                            source,
                        },
                    )
                }
            }
        }

        if !unit_failed {
            result.complete(message);
            return self.finish(result);
        }

        let error = ExecutorError::ModuleFailed(if message.is_empty() {
            "unit reported failed=true".to_string()
        } else {
            message
        });
        if task.ignore_errors {
            info!(error = %error, "Ignoring task failure");
            result.failed = true;
            result.complete(error.to_string());
            self.finish(result)
        } else {
            self.fail(result, error)
        }
    }
}

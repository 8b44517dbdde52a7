//! Migration hooks.
//!
//! Hooks are user callbacks run around the DDL and DML phases of a migration
//! run. Each hook is isolated: an error or a panic inside one hook is
//! captured in the [`HookReport`] and never stops the remaining hooks or the
//! migration itself.

use super::error::MigrationError;
use crate::backend::SqlExecutor;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// When a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookTrigger {
    /// Before the first schema migration.
    BeforeDdl,
    /// After the last schema migration.
    AfterDdl,
    /// Before a migration that moves data.
    BeforeDml,
    /// After a migration that moves data.
    AfterDml,
}

impl std::fmt::Display for HookTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookTrigger::BeforeDdl => write!(f, "before_ddl"),
            HookTrigger::AfterDdl => write!(f, "after_ddl"),
            HookTrigger::BeforeDml => write!(f, "before_dml"),
            HookTrigger::AfterDml => write!(f, "after_dml"),
        }
    }
}

/// Error returned by a hook callback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HookError {
    /// Error message.
    pub message: String,
}

impl HookError {
    /// Create a hook error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<crate::backend::ExecutorError> for HookError {
    fn from(e: crate::backend::ExecutorError) -> Self {
        HookError::new(e.to_string())
    }
}

/// Data passed to a hook.
#[derive(Clone, Default)]
pub struct HookContext {
    /// Trigger being executed.
    pub trigger: Option<HookTrigger>,
    /// Schema version of the run, if any.
    pub version: Option<String>,
    /// Migrations covered by this trigger.
    pub migration_ids: Vec<String>,
    /// Database access for hooks that read or write data.
    pub executor: Option<Arc<dyn SqlExecutor>>,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
}

impl HookContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an executor.
    pub fn with_executor(mut self, executor: Arc<dyn SqlExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the migrations covered by the trigger.
    pub fn with_migrations(mut self, ids: Vec<String>) -> Self {
        self.migration_ids = ids;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl std::fmt::Debug for HookContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookContext")
            .field("trigger", &self.trigger)
            .field("version", &self.version)
            .field("migration_ids", &self.migration_ids)
            .field("has_executor", &self.executor.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Synchronous hook function.
pub type SyncHookFn = dyn Fn(&HookContext) -> Result<Value, HookError> + Send + Sync;

/// Asynchronous hook function.
pub type AsyncHookFn =
    dyn Fn(HookContext) -> BoxFuture<'static, Result<Value, HookError>> + Send + Sync;

/// A hook callback.
#[derive(Clone)]
pub enum HookCallback {
    /// Runs inline.
    Sync(Arc<SyncHookFn>),
    /// Awaited before the next hook starts.
    Async(Arc<AsyncHookFn>),
}

impl HookCallback {
    /// Wrap a synchronous function.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&HookContext) -> Result<Value, HookError> + Send + Sync + 'static,
    {
        HookCallback::Sync(Arc::new(f))
    }

    /// Wrap an asynchronous function.
    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HookError>> + Send + 'static,
    {
        HookCallback::Async(Arc::new(move |ctx| f(ctx).boxed()))
    }
}

impl std::fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookCallback::Sync(_) => f.write_str("HookCallback::Sync"),
            HookCallback::Async(_) => f.write_str("HookCallback::Async"),
        }
    }
}

/// A registered hook.
#[derive(Debug, Clone)]
pub struct MigrationHook {
    /// Hook name.
    pub name: String,
    /// Schema version the hook belongs to; `None` for every version.
    pub version: Option<String>,
    /// Trigger.
    pub trigger: HookTrigger,
    /// Callback.
    pub callback: HookCallback,
    /// Higher runs first.
    pub priority: i32,
    /// Optional description.
    pub description: Option<String>,
}

impl MigrationHook {
    /// Whether the callback is asynchronous.
    pub fn is_async(&self) -> bool {
        matches!(self.callback, HookCallback::Async(_))
    }

    async fn run(&self, context: HookContext) -> HookOutcome {
        let result = match &self.callback {
            HookCallback::Sync(f) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| f(&context))).map_err(panic_message)
            }
            HookCallback::Async(f) => {
                let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| f(context))) {
                    Ok(fut) => fut,
                    Err(payload) => {
                        return HookOutcome::Failed {
                            error: format!("hook panicked: {}", panic_message(payload)),
                        }
                    }
                };
                AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .map_err(panic_message)
            }
        };

        match result {
            Ok(Ok(value)) => HookOutcome::Success(value),
            Ok(Err(e)) => HookOutcome::Failed { error: e.message },
            Err(panic) => HookOutcome::Failed {
                error: format!("hook panicked: {panic}"),
            },
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result of one hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HookOutcome {
    /// The hook returned a value.
    Success(Value),
    /// The hook failed or panicked.
    Failed {
        /// Error message.
        error: String,
    },
}

impl HookOutcome {
    /// JSON form: the returned value, or `{"error": message}`.
    pub fn to_value(&self) -> Value {
        match self {
            HookOutcome::Success(v) => v.clone(),
            HookOutcome::Failed { error } => json!({ "error": error }),
        }
    }

    /// Whether the hook succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, HookOutcome::Success(_))
    }
}

/// A hook's name and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    /// Hook name.
    pub name: String,
    /// Schema version the hook is bound to.
    pub version: Option<String>,
    /// Trigger the hook ran for.
    pub trigger: HookTrigger,
    /// Outcome.
    pub outcome: HookOutcome,
}

/// Outcomes of every hook scheduled for a trigger, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookReport {
    /// Results in execution order.
    pub results: Vec<HookResult>,
}

impl HookReport {
    /// Outcome of the named hook.
    pub fn get(&self, name: &str) -> Option<&HookOutcome> {
        self.results
            .iter()
            .find(|r| r.name == name)
            .map(|r| &r.outcome)
    }

    /// Number of hooks run.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether no hooks ran.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Failed hooks.
    pub fn failures(&self) -> impl Iterator<Item = &HookResult> {
        self.results.iter().filter(|r| !r.outcome.is_ok())
    }

    /// Append another report.
    pub fn extend(&mut self, other: HookReport) {
        self.results.extend(other.results);
    }

    /// JSON array with one entry per executed hook, in execution order.
    ///
    /// Hooks sharing a name stay distinct by version and trigger.
    pub fn to_json(&self) -> Value {
        Value::Array(
            self.results
                .iter()
                .map(|r| {
                    json!({
                        "name": r.name,
                        "version": r.version,
                        "trigger": r.trigger.to_string(),
                        "result": r.outcome.to_value(),
                    })
                })
                .collect(),
        )
    }
}

/// Registry of migration hooks.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<MigrationHook>>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook.
    ///
    /// Fails if a hook with the same trigger, name and version exists.
    pub fn register(
        &self,
        name: impl Into<String>,
        version: Option<String>,
        trigger: HookTrigger,
        callback: HookCallback,
        priority: i32,
        description: Option<String>,
    ) -> Result<(), MigrationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(MigrationError::Hook {
                message: "hook name must not be empty".to_string(),
            });
        }

        let mut hooks = self.hooks.write();
        if hooks
            .iter()
            .any(|h| h.trigger == trigger && h.name == name && h.version == version)
        {
            return Err(MigrationError::Hook {
                message: format!("hook '{name}' already registered for {trigger}"),
            });
        }

        debug!(hook = %name, %trigger, priority, "Registered migration hook");
        hooks.push(Arc::new(MigrationHook {
            name,
            version,
            trigger,
            callback,
            priority,
            description,
        }));
        Ok(())
    }

    /// Start building a hook.
    pub fn hook(&self, name: impl Into<String>, trigger: HookTrigger) -> HookBuilder<'_> {
        HookBuilder {
            registry: self,
            name: name.into(),
            trigger,
            version: None,
            priority: 0,
            description: None,
        }
    }

    /// Hooks for a trigger, highest priority first, ties in registration
    /// order.
    pub fn get_hooks(&self, trigger: HookTrigger) -> Vec<Arc<MigrationHook>> {
        let mut hooks: Vec<Arc<MigrationHook>> = self
            .hooks
            .read()
            .iter()
            .filter(|h| h.trigger == trigger)
            .cloned()
            .collect();
        hooks.sort_by(|a, b| b.priority.cmp(&a.priority));
        hooks
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    /// Whether no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    /// Run the hooks of a trigger sequentially.
    ///
    /// With `version = Some(v)` only hooks registered for `v` run.
    pub async fn execute_hooks(
        &self,
        trigger: HookTrigger,
        version: Option<&str>,
        context: HookContext,
    ) -> HookReport {
        let hooks: Vec<Arc<MigrationHook>> = self
            .get_hooks(trigger)
            .into_iter()
            .filter(|h| version.is_none() || h.version.as_deref() == version)
            .collect();

        let mut context = context;
        context.trigger = Some(trigger);
        if context.version.is_none() {
            context.version = version.map(str::to_string);
        }

        let mut report = HookReport::default();
        for hook in hooks {
            let outcome = hook.run(context.clone()).await;
            if let HookOutcome::Failed { error } = &outcome {
                warn!(hook = %hook.name, %trigger, error = %error, "Migration hook failed");
            }
            report.results.push(HookResult {
                name: hook.name.clone(),
                version: hook.version.clone(),
                trigger,
                outcome,
            });
        }
        report
    }

    /// Blocking form of [`execute_hooks`](Self::execute_hooks).
    pub fn execute_hooks_blocking(
        &self,
        trigger: HookTrigger,
        version: Option<&str>,
        context: HookContext,
    ) -> HookReport {
        futures::executor::block_on(self.execute_hooks(trigger, version, context))
    }
}

/// Builder for registering a hook.
pub struct HookBuilder<'a> {
    registry: &'a HookRegistry,
    name: String,
    trigger: HookTrigger,
    version: Option<String>,
    priority: i32,
    description: Option<String>,
}

impl HookBuilder<'_> {
    /// Restrict the hook to a schema version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the priority (higher runs first).
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Register a synchronous callback.
    pub fn run<F>(self, f: F) -> Result<(), MigrationError>
    where
        F: Fn(&HookContext) -> Result<Value, HookError> + Send + Sync + 'static,
    {
        self.finish(HookCallback::sync(f))
    }

    /// Register an asynchronous callback.
    pub fn run_async<F, Fut>(self, f: F) -> Result<(), MigrationError>
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HookError>> + Send + 'static,
    {
        self.finish(HookCallback::asynchronous(f))
    }

    fn finish(self, callback: HookCallback) -> Result<(), MigrationError> {
        self.registry.register(
            self.name,
            self.version,
            self.trigger,
            callback,
            self.priority,
            self.description,
        )
    }
}

//! Migration engine - orchestrates detection, planning and execution.
//!
//! A run walks these states:
//!
//! ```text
//! Idle -> Detecting -> UpToDate
//!                   -> Classifying -> Generating -> PlanReady -> Reported
//!                                                 -> AcquiringLock -> LockFailed
//!                                                 -> LockHeld -> Executing{Safe,Medium,High}
//!                                                    -> Recording -> ReleasingLock -> Complete
//!                                                    -> PartialFailure -> ReleasingLock -> Failed
//! ```

use super::detect::{DetectorOptions, SchemaDetector};
use super::error::{MigrationError, RiskLevel};
use super::hooks::{HookContext, HookRegistry, HookReport, HookTrigger};
use super::plan::{
    is_rebuild, strip_transaction_frame, Migration, MigrationGenerator, MigrationPlan, PlanStatus,
    Strategy,
};
use super::risk::RiskClassifier;
use super::storage::MigrationStorage;
use crate::backend::{SqlExecutor, SqliteDatabase};
use crate::config::{MigrationConfig, MigrationMode};
use crate::lock::{FileLock, LockGuard, LockProvider, TableLock};
use crate::schema::{SchemaIntrospector, TargetSchema};
use crate::space::DiskSpaceChecker;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// State of an engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Detecting,
    UpToDate,
    Classifying,
    Generating,
    PlanReady,
    Reported,
    AcquiringLock,
    LockFailed,
    LockHeld,
    ExecutingSafe,
    ExecutingMedium,
    ExecutingHigh,
    PartialFailure,
    Recording,
    ReleasingLock,
    Complete,
    Failed,
}

impl EngineState {
    fn executing(risk: RiskLevel) -> Self {
        match risk {
            RiskLevel::Safe => EngineState::ExecutingSafe,
            RiskLevel::Medium => EngineState::ExecutingMedium,
            RiskLevel::High => EngineState::ExecutingHigh,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Approves migrations that require confirmation.
pub trait ConfirmationHandler: Send + Sync {
    /// Whether `migration` may run.
    fn confirm(&self, migration: &Migration) -> bool;
}

impl<F> ConfirmationHandler for F
where
    F: Fn(&Migration) -> bool + Send + Sync,
{
    fn confirm(&self, migration: &Migration) -> bool {
        self(migration)
    }
}

/// Cooperative cancellation, checked between migrations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// No changes were detected.
    UpToDate,
    /// Dry run: the plan was only reported.
    Reported,
    /// The selected migrations were applied.
    Complete,
}

/// A migration left out of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedMigration {
    /// Migration id.
    pub id: String,
    /// Migration risk.
    pub risk_level: RiskLevel,
    /// Why it was skipped.
    pub reason: String,
}

/// Result of [`MigrationEngine::auto_migrate`].
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// How the run ended.
    pub outcome: RunOutcome,
    /// The generated plan.
    pub plan: MigrationPlan,
    /// Ids of applied migrations, in order.
    pub applied: Vec<String>,
    /// Migrations not applied because of mode or confirmation.
    pub skipped: Vec<SkippedMigration>,
    /// Results of every hook that ran.
    pub hooks: HookReport,
    /// States visited by the run.
    pub transitions: Vec<EngineState>,
}

impl MigrationReport {
    /// Whether nothing had to be done.
    pub fn is_up_to_date(&self) -> bool {
        self.outcome == RunOutcome::UpToDate
    }

    /// Plan warnings.
    pub fn warnings(&self) -> &[String] {
        &self.plan.warnings
    }
}

/// Runs automatic migrations against one database.
pub struct MigrationEngine {
    executor: Arc<dyn SqlExecutor>,
    introspector: Arc<dyn SchemaIntrospector>,
    target: Arc<dyn TargetSchema>,
    config: MigrationConfig,
    classifier: RiskClassifier,
    hooks: Arc<HookRegistry>,
    lock: Option<Box<dyn LockProvider>>,
    space: Option<DiskSpaceChecker>,
    confirmation: Option<Box<dyn ConfirmationHandler>>,
    cancellation: CancellationToken,
    storage: MigrationStorage,
    state: Mutex<Vec<EngineState>>,
}

impl MigrationEngine {
    /// Create an engine.
    ///
    /// With locking enabled the engine defaults to a [`TableLock`] on the
    /// executor. The database is treated as a server that manages its own
    /// storage unless a disk space checker is supplied.
    pub fn new(
        executor: Arc<dyn SqlExecutor>,
        introspector: Arc<dyn SchemaIntrospector>,
        target: Arc<dyn TargetSchema>,
        config: MigrationConfig,
    ) -> Self {
        let lock: Option<Box<dyn LockProvider>> = if config.use_lock {
            Some(Box::new(TableLock::new(executor.clone(), config.lock.clone())))
        } else {
            None
        };
        Self {
            storage: MigrationStorage::new(executor.clone()),
            executor,
            introspector,
            target,
            config,
            classifier: RiskClassifier::new(),
            hooks: Arc::new(HookRegistry::new()),
            lock,
            space: Some(DiskSpaceChecker::for_server()),
            confirmation: None,
            cancellation: CancellationToken::new(),
            state: Mutex::new(vec![EngineState::Idle]),
        }
    }

    /// Engine for a SQLite database.
    ///
    /// A file database gets a lock file next to it and a disk space check;
    /// an in-memory database gets a lock table.
    pub fn for_sqlite(
        db: Arc<SqliteDatabase>,
        target: Arc<dyn TargetSchema>,
        config: MigrationConfig,
    ) -> Self {
        let path = db.path().map(|p| p.to_path_buf());
        let mut engine = Self::new(db.clone(), db, target, config);

        if let Some(path) = path {
            if engine.config.use_lock {
                let dir = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                    _ => std::path::PathBuf::from("."),
                };
                engine.lock = Some(Box::new(FileLock::new(dir, engine.config.lock.clone())));
            }
            let reserve = engine.config.min_free_space_bytes;
            engine.space = Some(DiskSpaceChecker::for_file(path, reserve));
        }
        engine
    }

    /// Use a hook registry.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Use a lock provider instead of the default one.
    pub fn with_lock(mut self, lock: Box<dyn LockProvider>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Check disk space before table rebuilds.
    pub fn with_space_checker(mut self, checker: DiskSpaceChecker) -> Self {
        self.space = Some(checker);
        self
    }

    /// Ask `handler` before running migrations that require confirmation.
    pub fn with_confirmation(mut self, handler: Box<dyn ConfirmationHandler>) -> Self {
        self.confirmation = Some(handler);
        self
    }

    /// Stop between migrations when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Use a custom risk classifier.
    pub fn with_classifier(mut self, classifier: RiskClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Hook registry.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Migration history store.
    pub fn storage(&self) -> &MigrationStorage {
        &self.storage
    }

    /// States visited by the latest run, failed runs included.
    pub fn last_transitions(&self) -> Vec<EngineState> {
        self.state.lock().clone()
    }

    fn transition(&self, next: EngineState) {
        let mut states = self.state.lock();
        let from = states.last().copied().unwrap_or(EngineState::Idle);
        debug!(%from, to = %next, "Migration engine transition");
        states.push(next);
    }

    fn generator(&self) -> MigrationGenerator {
        MigrationGenerator::new(self.executor.dialect(), self.config.generator.clone())
            .with_classifier(self.classifier.clone())
    }

    /// Detect, plan and (unless dry-running) apply pending schema changes.
    #[instrument(skip(self), fields(mode = %self.config.mode))]
    pub fn auto_migrate(&self) -> Result<MigrationReport, MigrationError> {
        self.config.validate()?;
        *self.state.lock() = vec![EngineState::Idle];

        self.transition(EngineState::Detecting);
        let live = self.introspector.snapshot()?;
        let target = self.target.target_snapshot();
        let detector = SchemaDetector::new(
            DetectorOptions::default().with_table_drops(self.config.report_table_drops),
        );
        let changes = detector.diff(&live, &target);

        if changes.is_empty() {
            self.transition(EngineState::UpToDate);
            info!("Schema is up to date");
            return Ok(self.report(
                RunOutcome::UpToDate,
                MigrationPlan::empty(self.executor.dialect()),
                Vec::new(),
                Vec::new(),
                HookReport::default(),
            ));
        }

        self.transition(EngineState::Classifying);
        let classified = self.classifier.classify_all(&changes)?;

        self.transition(EngineState::Generating);
        let mut plan = self.generator().plan_classified(classified, &live)?;
        self.transition(EngineState::PlanReady);
        for warning in &plan.warnings {
            warn!(warning = %warning, "Migration plan warning");
        }
        info!(
            migrations = plan.len(),
            max_risk = ?plan.max_risk(),
            "Generated migration plan"
        );

        if self.config.mode == MigrationMode::DryRun {
            self.transition(EngineState::Reported);
            info!(plan = %plan, "Dry run, plan not applied");
            return Ok(self.report(
                RunOutcome::Reported,
                plan,
                Vec::new(),
                Vec::new(),
                HookReport::default(),
            ));
        }

        let guard = self.acquire_lock()?;

        let mut run = Run::default();
        let result = self.execute_locked(&plan, &mut run);

        self.transition(EngineState::ReleasingLock);
        if let Some(guard) = guard {
            release_lock(guard);
        }

        match result {
            Ok(()) => {
                plan.status = PlanStatus::Complete;
                self.transition(EngineState::Complete);
                info!(
                    applied = run.applied.len(),
                    skipped = run.skipped.len(),
                    "Migration run complete"
                );
                Ok(self.report(RunOutcome::Complete, plan, run.applied, run.skipped, run.hooks))
            }
            Err(e) => {
                self.transition(EngineState::Failed);
                warn!(error = %e, applied = run.applied.len(), "Migration run failed");
                Err(e)
            }
        }
    }

    fn report(
        &self,
        outcome: RunOutcome,
        plan: MigrationPlan,
        applied: Vec<String>,
        skipped: Vec<SkippedMigration>,
        hooks: HookReport,
    ) -> MigrationReport {
        MigrationReport {
            outcome,
            plan,
            applied,
            skipped,
            hooks,
            transitions: self.last_transitions(),
        }
    }

    fn acquire_lock(&self) -> Result<Option<LockGuard<'_>>, MigrationError> {
        let provider = match &self.lock {
            Some(provider) if self.config.use_lock => provider.as_ref(),
            _ => return Ok(None),
        };

        self.transition(EngineState::AcquiringLock);
        match LockGuard::acquire(provider, &self.config.lock_key, self.config.lock.timeout) {
            Ok(guard) => {
                self.transition(EngineState::LockHeld);
                debug!(key = %self.config.lock_key, holder = %provider.holder_id(), "Migration lock held");
                Ok(Some(guard))
            }
            Err(e) => {
                self.transition(EngineState::LockFailed);
                warn!(key = %self.config.lock_key, error = %e, "Could not acquire migration lock");
                Err(e)
            }
        }
    }

    /// Decide which migrations run, asking for confirmation where needed.
    ///
    /// Later migrations of a table were generated on top of the earlier
    /// ones, so once one is skipped the rest of that table is skipped too.
    fn select<'p>(&self, plan: &'p MigrationPlan) -> (Vec<&'p Migration>, Vec<SkippedMigration>) {
        let mut selected = Vec::new();
        let mut skipped = Vec::new();
        let mut blocked: HashMap<&str, &str> = HashMap::new();

        for migration in &plan.migrations {
            if let Some(blocker) = blocked.get(migration.table.as_str()) {
                let reason = format!("depends on skipped migration {blocker}");
                info!(id = %migration.id, risk = %migration.risk_level, reason = %reason, "Skipping migration");
                skipped.push(SkippedMigration {
                    id: migration.id.clone(),
                    risk_level: migration.risk_level,
                    reason,
                });
                continue;
            }

            let allowed = match (self.config.mode, migration.risk_level) {
                (MigrationMode::Safe, RiskLevel::Medium) if !self.config.allow_medium_in_safe_mode => {
                    Err("MEDIUM migrations are disabled in safe mode")
                }
                (MigrationMode::Safe, RiskLevel::High) => match &self.confirmation {
                    Some(handler) if handler.confirm(migration) => Ok(()),
                    Some(_) => Err("confirmation declined"),
                    None => Err("HIGH migrations require confirmation in safe mode"),
                },
                _ if migration.requires_confirmation => match &self.confirmation {
                    Some(handler) if !handler.confirm(migration) => Err("confirmation declined"),
                    _ => Ok(()),
                },
                _ => Ok(()),
            };

            match allowed {
                Ok(()) => selected.push(migration),
                Err(reason) => {
                    blocked.insert(migration.table.as_str(), migration.id.as_str());
                    info!(id = %migration.id, risk = %migration.risk_level, reason, "Skipping migration");
                    skipped.push(SkippedMigration {
                        id: migration.id.clone(),
                        risk_level: migration.risk_level,
                        reason: reason.to_string(),
                    });
                }
            }
        }
        (selected, skipped)
    }

    fn execute_locked(&self, plan: &MigrationPlan, run: &mut Run) -> Result<(), MigrationError> {
        self.storage.initialize()?;

        let (selected, skipped) = self.select(plan);
        run.skipped = skipped;
        if selected.is_empty() {
            self.transition(EngineState::Recording);
            return Ok(());
        }

        let rebuilds = selected.iter().any(|m| m.strategy == Strategy::CopySwapDrop);
        if rebuilds && self.config.check_disk_space {
            match &self.space {
                Some(checker) => checker.ensure_space_available(None)?,
                None => debug!("No disk space checker configured"),
            }
        }

        let ids: Vec<String> = selected.iter().map(|m| m.id.clone()).collect();
        run.hooks.extend(self.run_hooks(HookTrigger::BeforeDdl, ids.clone()));

        let mut tier = None;
        for migration in selected {
            if self.cancellation.is_cancelled() {
                self.transition(EngineState::PartialFailure);
                warn!(applied = run.applied.len(), "Migration run cancelled");
                return Err(MigrationError::Cancelled {
                    applied: run.applied.len(),
                });
            }
            if tier != Some(migration.risk_level) {
                tier = Some(migration.risk_level);
                self.transition(EngineState::executing(migration.risk_level));
            }
            self.apply(migration, run)?;
        }

        self.transition(EngineState::Recording);
        run.hooks.extend(self.run_hooks(HookTrigger::AfterDdl, ids));
        Ok(())
    }

    fn apply(&self, migration: &Migration, run: &mut Run) -> Result<(), MigrationError> {
        if migration.has_dml {
            run.hooks
                .extend(self.run_hooks(HookTrigger::BeforeDml, vec![migration.id.clone()]));
        }

        let statements = migration.upgrade_statements();
        debug!(id = %migration.id, statements = statements.len(), "Applying migration");
        let result = match migration.strategy {
            Strategy::CopySwapDrop => self.executor.execute_rebuild(&statements),
            Strategy::DirectDdl => self.executor.execute_transaction(&statements),
        };
        if let Err(e) = result {
            let fallback = statements.first().map(String::as_str).unwrap_or_default();
            let error = MigrationError::execution(&migration.id, fallback, e);
            self.transition(EngineState::PartialFailure);
            if let Err(record_error) = self.storage.record_failure(
                &migration.id,
                &migration.description,
                migration.risk_level,
                &error.to_string(),
            ) {
                warn!(id = %migration.id, error = %record_error, "Failed to record migration failure");
            }
            return Err(error);
        }

        self.storage.record_migration(
            &migration.id,
            &migration.description,
            &migration.rollback_sql,
            migration.risk_level,
        )?;
        run.applied.push(migration.id.clone());
        info!(
            id = %migration.id,
            risk = %migration.risk_level,
            description = %migration.description,
            "Applied migration"
        );

        if migration.has_dml {
            run.hooks
                .extend(self.run_hooks(HookTrigger::AfterDml, vec![migration.id.clone()]));
        }
        Ok(())
    }

    fn run_hooks(&self, trigger: HookTrigger, migration_ids: Vec<String>) -> HookReport {
        let context = HookContext::new()
            .with_executor(self.executor.clone())
            .with_migrations(migration_ids)
            .with_metadata("mode", Value::String(self.config.mode.to_string()))
            .with_metadata("dialect", Value::String(self.executor.dialect().to_string()));
        self.hooks
            .execute_hooks_blocking(trigger, self.config.schema_version.as_deref(), context)
    }

    /// Revert an applied migration using its recorded rollback SQL.
    ///
    /// Runs under the migration lock and appends a `rolled_back` history row.
    #[instrument(skip(self))]
    pub fn rollback(&self, version: &str) -> Result<(), MigrationError> {
        self.config.validate()?;
        *self.state.lock() = vec![EngineState::Idle];
        let guard = self.acquire_lock()?;

        let result = self.rollback_locked(version);

        self.transition(EngineState::ReleasingLock);
        if let Some(guard) = guard {
            release_lock(guard);
        }
        self.transition(if result.is_ok() {
            EngineState::Complete
        } else {
            EngineState::Failed
        });
        result
    }

    fn rollback_locked(&self, version: &str) -> Result<(), MigrationError> {
        self.storage.initialize()?;
        let entry = self
            .storage
            .find_applied(version)?
            .ok_or_else(|| MigrationError::NotFound {
                version: version.to_string(),
            })?;

        let statements = strip_transaction_frame(&entry.rollback_sql);
        let result = if is_rebuild(&entry.rollback_sql) {
            self.executor.execute_rebuild(&statements)
        } else {
            self.executor.execute_transaction(&statements)
        };
        if let Err(e) = result {
            let fallback = statements.first().map(String::as_str).unwrap_or_default();
            return Err(MigrationError::execution(version, fallback, e));
        }

        self.storage.record_rollback(
            version,
            &format!("Rollback of {}", entry.description),
            entry.risk_level,
        )?;
        info!(version, "Rolled back migration");
        Ok(())
    }
}

fn release_lock(guard: LockGuard<'_>) {
    let key = guard.key().to_string();
    match guard.release() {
        Ok(true) => {}
        Ok(false) => warn!(key = %key, "Migration lock was lost before release"),
        Err(e) => warn!(key = %key, error = %e, "Failed to release migration lock"),
    }
}

/// Per-run bookkeeping.
#[derive(Default)]
struct Run {
    applied: Vec<String>,
    skipped: Vec<SkippedMigration>,
    hooks: HookReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqlValue;
    use crate::migration::storage::HistoryStatus;
    use crate::schema::{ColumnDef, SchemaSnapshot, TableDef};
    use std::time::Duration;

    fn users_v1() -> TableDef {
        TableDef::new("users")
            .with_column(ColumnDef::new("id", "INTEGER").primary_key())
            .with_column(ColumnDef::new("name", "VARCHAR"))
    }

    fn engine_for(
        db: &Arc<SqliteDatabase>,
        target: SchemaSnapshot,
        config: MigrationConfig,
    ) -> MigrationEngine {
        MigrationEngine::for_sqlite(db.clone(), Arc::new(target), config)
    }

    fn memory_db() -> Arc<SqliteDatabase> {
        Arc::new(SqliteDatabase::open_in_memory().unwrap())
    }

    fn fast_config() -> MigrationConfig {
        MigrationConfig::default().with_lock_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_up_to_date_never_locks() {
        let db = memory_db();
        let engine = engine_for(&db, SchemaSnapshot::new(), fast_config());

        let report = engine.auto_migrate().unwrap();
        assert!(report.is_up_to_date());
        assert_eq!(
            report.transitions,
            vec![EngineState::Idle, EngineState::Detecting, EngineState::UpToDate]
        );
        // Neither the lock table nor the history table was created.
        assert!(db.query("SELECT name FROM sqlite_master", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_create_table_and_record() {
        let db = memory_db();
        let engine = engine_for(
            &db,
            SchemaSnapshot::new().with_table(users_v1()),
            fast_config(),
        );

        let report = engine.auto_migrate().unwrap();
        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.plan.status, PlanStatus::Complete);
        assert!(report.transitions.contains(&EngineState::LockHeld));
        assert!(report.transitions.contains(&EngineState::ExecutingSafe));
        assert_eq!(report.transitions.last(), Some(&EngineState::Complete));

        let history = engine.storage().get_migration_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, report.applied[0]);
        assert_eq!(history[0].status, HistoryStatus::Applied);

        // Second run is a no-op.
        assert!(engine.auto_migrate().unwrap().is_up_to_date());
    }

    #[test]
    fn test_dry_run_applies_nothing() {
        let db = memory_db();
        let engine = engine_for(
            &db,
            SchemaSnapshot::new().with_table(users_v1()),
            MigrationConfig::dry_run(),
        );

        let report = engine.auto_migrate().unwrap();
        assert_eq!(report.outcome, RunOutcome::Reported);
        assert_eq!(report.plan.len(), 1);
        assert!(report.applied.is_empty());
        assert!(!report.transitions.contains(&EngineState::AcquiringLock));
        assert!(db.query("SELECT name FROM sqlite_master", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_safe_mode_skips_high() {
        let db = memory_db();
        db.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name VARCHAR, legacy TEXT)")
            .unwrap();
        let target = SchemaSnapshot::new().with_table(
            users_v1().with_column(ColumnDef::new("age", "INTEGER")),
        );
        let engine = engine_for(
            &db,
            target,
            fast_config().with_mode(MigrationMode::Safe),
        );

        let report = engine.auto_migrate().unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].risk_level, RiskLevel::High);

        let columns: Vec<String> = db
            .query("SELECT name FROM pragma_table_info('users') ORDER BY cid", &[])
            .unwrap()
            .into_iter()
            .filter_map(|row| row[0].as_str().map(str::to_string))
            .collect();
        assert_eq!(columns, vec!["id", "name", "legacy", "age"]);
    }

    #[test]
    fn test_confirmation_declined_skips() {
        let db = memory_db();
        db.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name VARCHAR, legacy TEXT)")
            .unwrap();
        let engine = engine_for(
            &db,
            SchemaSnapshot::new().with_table(users_v1()),
            fast_config(),
        )
        .with_confirmation(Box::new(|_: &Migration| false));

        let report = engine.auto_migrate().unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped[0].reason, "confirmation declined");
    }

    #[test]
    fn test_execution_failure_is_recorded() {
        let db = memory_db();
        db.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name VARCHAR)")
            .unwrap();
        db.execute("INSERT INTO users (name) VALUES ('a')", &[]).unwrap();
        // NOT NULL without default or backfill cannot be added to a non-empty table.
        let target = SchemaSnapshot::new().with_table(
            users_v1().with_column(ColumnDef::required("email", "VARCHAR")),
        );
        let engine = engine_for(&db, target, fast_config());

        let err = engine.auto_migrate().unwrap_err();
        match &err {
            MigrationError::Execution { statement, .. } => {
                assert!(statement.contains("ADD COLUMN email"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let states = engine.last_transitions();
        assert!(states.contains(&EngineState::PartialFailure));
        assert_eq!(states.last(), Some(&EngineState::Failed));

        let history = engine.storage().get_migration_history(10).unwrap();
        assert_eq!(history[0].status, HistoryStatus::Failed);
        // Lock row released.
        let locks = db
            .query("SELECT COUNT(*) FROM _migration_locks", &[])
            .unwrap();
        assert_eq!(locks[0][0], SqlValue::Integer(0));
    }

    #[test]
    fn test_cancelled_before_first_migration() {
        let db = memory_db();
        let token = CancellationToken::new();
        token.cancel();
        let engine = engine_for(
            &db,
            SchemaSnapshot::new().with_table(users_v1()),
            fast_config(),
        )
        .with_cancellation(token);

        assert!(matches!(
            engine.auto_migrate(),
            Err(MigrationError::Cancelled { applied: 0 })
        ));
    }

    #[test]
    fn test_rollback_restores_schema() {
        let db = memory_db();
        let engine = engine_for(
            &db,
            SchemaSnapshot::new().with_table(users_v1()),
            fast_config(),
        );
        let report = engine.auto_migrate().unwrap();
        let version = &report.applied[0];

        engine.rollback(version).unwrap();
        assert!(db.snapshot().unwrap().is_empty());
        assert!(matches!(
            engine.rollback(version),
            Err(MigrationError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rollback_unknown_version() {
        let db = memory_db();
        let engine = engine_for(&db, SchemaSnapshot::new(), fast_config());
        assert!(matches!(
            engine.rollback("nope"),
            Err(MigrationError::NotFound { .. })
        ));
    }

    #[test]
    fn test_hooks_receive_run_metadata() {
        let db = memory_db();
        let hooks = Arc::new(HookRegistry::new());
        hooks
            .hook("inspect", HookTrigger::BeforeDdl)
            .run(|ctx| Ok(Value::Object(ctx.metadata.clone())))
            .unwrap();
        let engine = engine_for(
            &db,
            SchemaSnapshot::new().with_table(users_v1()),
            fast_config(),
        )
        .with_hooks(hooks);

        let report = engine.auto_migrate().unwrap();
        assert_eq!(
            report.hooks.get("inspect"),
            Some(&crate::migration::HookOutcome::Success(
                serde_json::json!({"mode": "auto", "dialect": "sqlite"})
            ))
        );
    }
}

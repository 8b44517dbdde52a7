//! automigrate - Automatic, risk-graded schema migrations.
//!
//! This crate compares a live relational database with a declared schema,
//! grades every difference as SAFE, MEDIUM or HIGH risk, and applies
//! reversible migrations under a distributed lock while keeping an
//! append-only history.

pub mod backend;
pub mod config;
pub mod lock;
pub mod migration;
pub mod schema;
pub mod space;

pub use backend::{ExecutorError, SqlExecutor, SqlValue, SqliteDatabase};
pub use config::{MigrationConfig, MigrationMode};
pub use lock::{FileLock, LockConfig, LockGuard, LockProvider, TableLock};
pub use migration::{
    CancellationToken, ConfirmationHandler, EngineState, HookRegistry, HookTrigger, Migration,
    MigrationEngine, MigrationError, MigrationPlan, MigrationReport, MigrationStorage, RiskLevel,
    RunOutcome, SchemaChange, SchemaDetector,
};
pub use schema::{
    ColumnDef, ColumnDefault, ConstraintDef, DeclaredModel, Dialect, ModelRegistry,
    SchemaIntrospector, SchemaSnapshot, SoftDelete, TableDef, TargetSchema,
};
pub use space::{DiskSpaceChecker, StorageBackend};

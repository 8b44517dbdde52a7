//! Automatic schema migration.
//!
//! This module compares a live database with a declared schema and applies
//! the difference:
//! - Schema change detection
//! - Risk classification (SAFE/MEDIUM/HIGH)
//! - Reversible SQL generation, direct or Copy-Swap-Drop
//! - Locked, tiered execution with hooks and an append-only history
//!
//! # Risk Levels
//!
//! | Risk | Examples | Behavior |
//! |------|----------|----------|
//! | **SAFE** | New tables, nullable columns, dropped constraints | Applied in every mode |
//! | **MEDIUM** | NOT NULL column without default, new constraints | Safe mode only when allowed |
//! | **HIGH** | Dropped tables or columns, type changes | Requires confirmation, rebuilds the table when needed |
//!
//! # Example
//!
//! ```ignore
//! use automigrate::migration::MigrationEngine;
//!
//! let engine = MigrationEngine::for_sqlite(db, Arc::new(models), MigrationConfig::default());
//! let report = engine.auto_migrate()?;
//! println!("{}", report.plan);
//! ```

pub mod detect;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod plan;
pub mod risk;
pub mod sql;
pub mod storage;

// Error types
pub use error::{MigrationError, RiskLevel, Stage};

// Detection types
pub use detect::{ChangeKind, Definition, DetectorOptions, SchemaChange, SchemaDetector};

// Classification types
pub use risk::{ClassifiedChange, RiskClassifier, RiskRule, RuleCondition, DEFAULT_RULES};

// Plan types
pub use plan::{
    generate_migration_id, Backfill, GeneratorOptions, Migration, MigrationGenerator,
    MigrationPlan, PlanStatus, Strategy,
};

// Hook types
pub use hooks::{
    HookCallback, HookContext, HookError, HookOutcome, HookReport, HookResult, HookTrigger,
    MigrationHook, HookRegistry,
};

// Storage types
pub use storage::{HistoryEntry, HistoryOrder, HistoryStatus, MigrationStorage, MIGRATIONS_TABLE};

// Engine types
pub use engine::{
    CancellationToken, ConfirmationHandler, EngineState, MigrationEngine, MigrationReport,
    RunOutcome, SkippedMigration,
};

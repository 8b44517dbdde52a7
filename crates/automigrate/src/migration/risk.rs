//! Risk classification.
//!
//! Each change is graded by the first matching rule of a fixed table:
//!
//! | Change | Condition | Risk |
//! |--------|-----------|------|
//! | CreateTable | | SAFE |
//! | AddColumn | nullable or defaulted | SAFE |
//! | AddColumn | NOT NULL, no default | MEDIUM |
//! | DropColumn, DropTable | | HIGH |
//! | AlterColumnType | | HIGH |
//! | AddConstraint | | MEDIUM |
//! | DropConstraint | | SAFE |

use super::detect::{ChangeKind, SchemaChange};
use super::error::{MigrationError, RiskLevel};

/// Extra condition a rule places on the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCondition {
    /// Always matches.
    Always,
    /// The new column is nullable or has a default.
    NullableOrDefaulted,
    /// The new column is NOT NULL without a default.
    NotNullWithoutDefault,
}

impl RuleCondition {
    fn matches(&self, change: &SchemaChange) -> bool {
        match self {
            RuleCondition::Always => true,
            RuleCondition::NullableOrDefaulted => change
                .new_column()
                .is_some_and(|c| c.is_nullable_or_defaulted()),
            RuleCondition::NotNullWithoutDefault => change
                .new_column()
                .is_some_and(|c| !c.is_nullable_or_defaulted()),
        }
    }
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskRule {
    /// Change kind the rule applies to.
    pub kind: ChangeKind,
    /// Extra condition.
    pub condition: RuleCondition,
    /// Assigned risk.
    pub risk: RiskLevel,
}

impl RiskRule {
    /// Create a rule.
    pub const fn new(kind: ChangeKind, condition: RuleCondition, risk: RiskLevel) -> Self {
        Self {
            kind,
            condition,
            risk,
        }
    }
}

/// The default classification table.
pub const DEFAULT_RULES: &[RiskRule] = &[
    RiskRule::new(ChangeKind::CreateTable, RuleCondition::Always, RiskLevel::Safe),
    RiskRule::new(
        ChangeKind::AddColumn,
        RuleCondition::NullableOrDefaulted,
        RiskLevel::Safe,
    ),
    RiskRule::new(
        ChangeKind::AddColumn,
        RuleCondition::NotNullWithoutDefault,
        RiskLevel::Medium,
    ),
    RiskRule::new(ChangeKind::DropColumn, RuleCondition::Always, RiskLevel::High),
    RiskRule::new(ChangeKind::DropTable, RuleCondition::Always, RiskLevel::High),
    RiskRule::new(ChangeKind::AlterColumnType, RuleCondition::Always, RiskLevel::High),
    RiskRule::new(ChangeKind::AddConstraint, RuleCondition::Always, RiskLevel::Medium),
    RiskRule::new(ChangeKind::DropConstraint, RuleCondition::Always, RiskLevel::Safe),
];

/// A change with its risk.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedChange {
    /// The change.
    pub change: SchemaChange,
    /// Its risk.
    pub risk: RiskLevel,
}

/// Grades schema changes.
#[derive(Debug, Clone)]
pub struct RiskClassifier {
    rules: Vec<RiskRule>,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskClassifier {
    /// Classifier using [`DEFAULT_RULES`].
    pub fn new() -> Self {
        Self::with_rules(DEFAULT_RULES.to_vec())
    }

    /// Classifier using a custom rule table.
    pub fn with_rules(rules: Vec<RiskRule>) -> Self {
        Self { rules }
    }

    /// Risk of a single change.
    pub fn classify(&self, change: &SchemaChange) -> Result<RiskLevel, MigrationError> {
        self.rules
            .iter()
            .find(|rule| rule.kind == change.kind && rule.condition.matches(change))
            .map(|rule| rule.risk)
            .ok_or_else(|| MigrationError::UnknownChangeKind {
                kind: change.kind.to_string(),
                table: change.table.clone(),
            })
    }

    /// Classify a list of changes, preserving order.
    pub fn classify_all(
        &self,
        changes: &[SchemaChange],
    ) -> Result<Vec<ClassifiedChange>, MigrationError> {
        changes
            .iter()
            .map(|change| {
                Ok(ClassifiedChange {
                    risk: self.classify(change)?,
                    change: change.clone(),
                })
            })
            .collect()
    }
}

//! Imputation stages
//!
//! Stages run in dependency order: geography, then sociodemographics, then
//! the childcare sequence. Each stage reads an immutable snapshot of the
//! completed worlds produced so far and returns the rows it imputed along
//! with per-unit diagnostics. Nothing in a stage writes to storage.

pub mod childcare;
pub mod geography;
pub mod sociodemographic;

use std::collections::BTreeMap;
use std::fmt;

use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};

use crate::algorithm::models::{ImputerRegistry, ModelFamily};
use crate::config::StudyConfig;
use crate::models::{ImputationIndex, ImputedRows, ImputedValueRow, VariableCatalog};

pub use childcare::run_childcare;
pub use geography::run_geography;
pub use sociodemographic::run_sociodemographic;

/// The three stages of a run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Geography,
    Sociodemographic,
    Childcare,
}

impl StageKind {
    pub const ALL: [Self; 3] = [Self::Geography, Self::Sociodemographic, Self::Childcare];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Geography => "geography",
            Self::Sociodemographic => "sociodemographic",
            Self::Childcare => "childcare",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a diagnostic entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Allocation string could not be parsed
    Parse,
    /// Model failed to converge and no fallback value was produced
    Convergence,
    /// Draw or value failed validation
    Validation,
    /// Draw fell outside the valid range and was dropped
    Rejected,
    /// Upstream value unavailable, unit skipped
    Skipped,
    /// Unconditional fallback used after a convergence failure
    Fallback,
}

impl IssueKind {
    /// Whether the unit ended up without a value
    #[must_use]
    pub const fn is_failure(self) -> bool {
        !matches!(self, Self::Fallback)
    }
}

/// One diagnostic entry for the run report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub variable: String,
    pub record_id: Option<String>,
    pub imputation: Option<ImputationIndex>,
    pub message: String,
}

impl Issue {
    pub fn new(kind: IssueKind, variable: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            variable: variable.to_string(),
            record_id: None,
            imputation: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn for_record(mut self, record_id: &str) -> Self {
        self.record_id = Some(record_id.to_string());
        self
    }

    #[must_use]
    pub const fn at(mut self, imputation: ImputationIndex) -> Self {
        self.imputation = Some(imputation);
        self
    }
}

/// Shared inputs of every stage
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub config: &'a StudyConfig,
    pub catalog: &'a VariableCatalog,
    pub registry: &'a ImputerRegistry,
    pub progress: Option<&'a ProgressBar>,
}

impl StageContext<'_> {
    pub(crate) fn tick(&self) {
        if let Some(progress) = self.progress {
            progress.inc(1);
        }
    }
}

/// Draws and diagnostics of one completed world
#[derive(Debug, Default)]
pub(crate) struct WorldDraws {
    pub rows: ImputedRows,
    pub attempted: usize,
    pub issues: Vec<Issue>,
}

impl WorldDraws {
    pub fn push(&mut self, variable: &str, row: ImputedValueRow) {
        self.rows.entry(variable.to_string()).or_default().push(row);
    }
}

/// Everything a stage produced across all M worlds
#[derive(Debug, Default)]
pub struct StageOutput {
    pub stage: Option<StageKind>,
    /// Rows per variable, sorted by (record, m)
    pub rows: ImputedRows,
    /// Model family per variable the stage is responsible for
    pub families: BTreeMap<String, ModelFamily>,
    /// Units that needed a value
    pub attempted: usize,
    pub issues: Vec<Issue>,
}

impl StageOutput {
    pub(crate) fn new(stage: StageKind, families: BTreeMap<String, ModelFamily>) -> Self {
        let rows = families.keys().map(|v| (v.clone(), Vec::new())).collect();
        Self {
            stage: Some(stage),
            rows,
            families,
            ..Self::default()
        }
    }

    pub(crate) fn absorb(&mut self, world: WorldDraws) {
        for (variable, rows) in world.rows {
            self.rows.entry(variable).or_default().extend(rows);
        }
        self.attempted += world.attempted;
        self.issues.extend(world.issues);
    }

    pub(crate) fn finish(mut self) -> Self {
        for rows in self.rows.values_mut() {
            rows.sort_by(|a, b| {
                a.record_id
                    .cmp(&b.record_id)
                    .then(a.imputation.cmp(&b.imputation))
            });
        }
        self.issues.sort_by(|a, b| {
            a.variable
                .cmp(&b.variable)
                .then_with(|| a.record_id.cmp(&b.record_id))
                .then(a.imputation.cmp(&b.imputation))
        });
        self
    }

    /// Units that ended without a value
    #[must_use]
    pub fn failed(&self) -> usize {
        self.issues.iter().filter(|i| i.kind.is_failure()).count()
    }

    /// Failed share of attempted units
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failed() as f64 / self.attempted as f64
        }
    }

    /// Rows of one completed world for one variable
    pub fn rows_for(
        &self,
        variable: &str,
        imputation: ImputationIndex,
    ) -> impl Iterator<Item = &ImputedValueRow> {
        self.rows
            .get(variable)
            .into_iter()
            .flatten()
            .filter(move |r| r.imputation == imputation)
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

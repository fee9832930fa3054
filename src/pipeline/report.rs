//! Run diagnostics
//!
//! Every run ends with a `RunReport`: counts per variable, the status of each
//! stage against its failure threshold, every unit-level issue and the run
//! time. The binary prints it and maps it to an exit status.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::algorithm::models::ModelFamily;
use crate::algorithm::stages::{Issue, IssueKind, StageKind, StageOutput};
use crate::error::{ImputationError, Result};
use crate::storage::SessionSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Tables reused from a previous run with the same inputs
    Resumed,
    /// Failure rate above threshold; nothing stored
    Aborted,
    /// Not reached because an earlier stage aborted
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted,
}

/// Counts for one imputed variable
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableSummary {
    pub stage: StageKind,
    pub family: Option<ModelFamily>,
    pub imputed: usize,
    pub failed: usize,
    pub fallback: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: StageKind,
    pub status: StageStatus,
    pub attempted: usize,
    pub failed: usize,
    pub failure_rate: f64,
    pub threshold: f64,
    pub rows: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub study_id: String,
    pub run_id: String,
    pub imputations: usize,
    pub seed: u64,
    pub outcome: RunOutcome,
    pub stages: Vec<StageSummary>,
    pub variables: BTreeMap<String, VariableSummary>,
    pub issues: Vec<Issue>,
    pub session: SessionSummary,
    pub runtime_ms: u64,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl RunReport {
    #[must_use]
    pub fn new(study_id: &str, run_id: &str, imputations: usize, seed: u64) -> Self {
        Self {
            study_id: study_id.to_string(),
            run_id: run_id.to_string(),
            imputations,
            seed,
            outcome: RunOutcome::Completed,
            stages: Vec::new(),
            variables: BTreeMap::new(),
            issues: Vec::new(),
            session: SessionSummary::default(),
            runtime_ms: 0,
        }
    }

    /// Record a stage that ran in this process
    pub fn record_stage(
        &mut self,
        output: &StageOutput,
        stage: StageKind,
        status: StageStatus,
        threshold: f64,
        elapsed: Duration,
    ) {
        for (variable, family) in &output.families {
            let issues = output.issues.iter().filter(|i| &i.variable == variable);
            let (mut failed, mut fallback, mut rejected) = (0, 0, 0);
            for issue in issues {
                if issue.kind.is_failure() {
                    failed += 1;
                }
                match issue.kind {
                    IssueKind::Fallback => fallback += 1,
                    IssueKind::Rejected => rejected += 1,
                    _ => {}
                }
            }
            self.variables.insert(
                variable.clone(),
                VariableSummary {
                    stage,
                    family: Some(*family),
                    imputed: output.rows.get(variable).map_or(0, Vec::len),
                    failed,
                    fallback,
                    rejected,
                },
            );
        }

        self.stages.push(StageSummary {
            stage,
            status,
            attempted: output.attempted,
            failed: output.failed(),
            failure_rate: output.failure_rate(),
            threshold,
            rows: output.row_count(),
            elapsed_ms: millis(elapsed),
        });
        self.issues.extend(output.issues.iter().cloned());
        if status == StageStatus::Aborted {
            self.outcome = RunOutcome::Aborted;
        }
    }

    /// Record a stage whose tables were reused
    pub fn record_resumed(
        &mut self,
        stage: StageKind,
        rows: &BTreeMap<String, usize>,
        threshold: f64,
    ) {
        for (variable, count) in rows {
            self.variables.insert(
                variable.clone(),
                VariableSummary {
                    stage,
                    family: None,
                    imputed: *count,
                    failed: 0,
                    fallback: 0,
                    rejected: 0,
                },
            );
        }
        self.stages.push(StageSummary {
            stage,
            status: StageStatus::Resumed,
            attempted: 0,
            failed: 0,
            failure_rate: 0.0,
            threshold,
            rows: rows.values().sum(),
            elapsed_ms: 0,
        });
    }

    /// Mark a stage as not reached
    pub fn record_skipped(&mut self, stage: StageKind, threshold: f64) {
        self.stages.push(StageSummary {
            stage,
            status: StageStatus::Skipped,
            attempted: 0,
            failed: 0,
            failure_rate: 0.0,
            threshold,
            rows: 0,
            elapsed_ms: 0,
        });
    }

    pub fn finish(&mut self, session: SessionSummary, runtime: Duration) {
        self.session = session;
        self.runtime_ms = millis(runtime);
    }

    /// The stage that aborted the run, if any
    #[must_use]
    pub fn aborted_stage(&self) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.status == StageStatus::Aborted)
    }

    /// Process exit status: non-zero when a stage exceeded its threshold
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Completed => 0,
            RunOutcome::Aborted => 2,
        }
    }

    /// Turn an aborted run into a `StageFailed` error
    pub fn into_result(self) -> Result<Self> {
        if let Some(stage) = self.aborted_stage() {
            return Err(ImputationError::StageFailed {
                stage: stage.stage.to_string(),
                failure_rate: stage.failure_rate,
                threshold: stage.threshold,
            });
        }
        Ok(self)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Imputation run {} for study '{}'", self.run_id, self.study_id)?;
        writeln!(
            f,
            "  M: {}  seed: {}  runtime: {} ms",
            self.imputations, self.seed, self.runtime_ms
        )?;
        writeln!(f, "  Outcome: {:?}", self.outcome)?;
        writeln!(f, "Stages:")?;
        for s in &self.stages {
            writeln!(
                f,
                "  {:<17} {:<9} attempted {:>7}  failed {:>5} ({:.2}% / {:.2}%)  rows {:>8}",
                s.stage.as_str(),
                format!("{:?}", s.status).to_lowercase(),
                s.attempted,
                s.failed,
                s.failure_rate * 100.0,
                s.threshold * 100.0,
                s.rows
            )?;
        }
        writeln!(f, "Variables:")?;
        for (name, v) in &self.variables {
            writeln!(
                f,
                "  {:<22} {:<26} imputed {:>8}  failed {:>5}  fallback {:>3}  rejected {:>5}",
                name,
                v.family.map_or("-", ModelFamily::as_str),
                v.imputed,
                v.failed,
                v.fallback,
                v.rejected
            )?;
        }
        if !self.issues.is_empty() {
            writeln!(f, "Issues: {}", self.issues.len())?;
        }
        Ok(())
    }
}

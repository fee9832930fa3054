//! Configuration for an imputation study.
//!
//! A `StudyConfig` is supplied per study, either built in code through
//! `StudyConfig::builder()` or loaded from a JSON document.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::util::safe_open_file;
use crate::error::{ImputationError, Result};

/// Default number of completed datasets
pub const DEFAULT_IMPUTATIONS: usize = 5;

/// Rule for the derived formal-care indicator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormalCareRule {
    /// Weekly hours at or above which care counts
    pub min_hours: f64,
    /// Care types that never count, whatever the hours
    pub exclusions: BTreeSet<String>,
}

impl Default for FormalCareRule {
    fn default() -> Self {
        Self {
            min_hours: 10.0,
            exclusions: BTreeSet::from(["Relative".to_string()]),
        }
    }
}

impl FormalCareRule {
    #[must_use]
    pub fn evaluate(&self, care_type: &str, hours: f64) -> bool {
        hours >= self.min_hours && !self.exclusions.contains(care_type)
    }
}

/// Configuration for one study's imputation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    /// Study identifier; also the storage namespace
    pub study_id: String,
    /// Number of completed datasets (M)
    pub imputations: usize,
    /// Base seed for every deterministic stream
    pub seed: u64,
    /// Tolerance on the allocation weight sum
    pub allocation_tolerance: f64,
    /// Upper bound on chained-equation cycles per completed world
    pub max_iterations: usize,
    /// Largest between-cycle change of a chain statistic considered stable
    pub convergence_tolerance: f64,
    /// Wall-clock budget for one model chain, in seconds
    pub fit_time_budget_secs: u64,
    /// Largest plausible weekly care hours; draws above it are rejected
    pub max_weekly_care_hours: f64,
    /// Derived indicator rule
    pub formal_care: FormalCareRule,
    /// Failure rate above which a stage aborts the run
    pub failure_threshold: f64,
    /// Worker threads for per-m work
    pub workers: usize,
    /// Root directory of the imputation store
    pub storage_root: PathBuf,
    /// Reuse stored tables whose input fingerprint still matches
    pub resume: bool,
    /// Show progress bars
    pub show_progress: bool,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            study_id: "study".to_string(),
            imputations: DEFAULT_IMPUTATIONS,
            seed: 20_240_101,
            allocation_tolerance: 1e-3,
            max_iterations: 10,
            convergence_tolerance: 0.05,
            fit_time_budget_secs: 300,
            max_weekly_care_hours: 168.0,
            formal_care: FormalCareRule::default(),
            failure_threshold: 0.05,
            workers: num_cpus::get(),
            storage_root: PathBuf::from("imputations"),
            resume: false,
            show_progress: false,
        }
    }
}

impl StudyConfig {
    /// Create a new builder for constructing a study configuration
    #[must_use]
    pub fn builder() -> StudyConfigBuilder {
        StudyConfigBuilder::new()
    }

    /// Load a configuration from a JSON file; absent keys take defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = safe_open_file(path, "study configuration")?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Chain time budget as a `Duration`
    #[must_use]
    pub const fn fit_time_budget(&self) -> Duration {
        Duration::from_secs(self.fit_time_budget_secs)
    }

    /// Check every knob is inside its meaningful range
    pub fn validate(&self) -> Result<()> {
        if self.study_id.is_empty()
            || !self
                .study_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ImputationError::config(format!(
                "study_id '{}' must be non-empty and use only [A-Za-z0-9_-]",
                self.study_id
            )));
        }
        if self.imputations == 0 || self.imputations > u32::MAX as usize {
            return Err(ImputationError::config("imputations must be at least 1"));
        }
        if !(self.allocation_tolerance >= 0.0 && self.allocation_tolerance < 1.0) {
            return Err(ImputationError::config(
                "allocation_tolerance must be in [0, 1)",
            ));
        }
        if self.max_iterations == 0 {
            return Err(ImputationError::config("max_iterations must be at least 1"));
        }
        if !(self.convergence_tolerance.is_finite() && self.convergence_tolerance >= 0.0) {
            return Err(ImputationError::config(
                "convergence_tolerance must be finite and non-negative",
            ));
        }
        if !(self.max_weekly_care_hours.is_finite() && self.max_weekly_care_hours > 0.0) {
            return Err(ImputationError::config(
                "max_weekly_care_hours must be positive",
            ));
        }
        if !(self.formal_care.min_hours.is_finite() && self.formal_care.min_hours >= 0.0) {
            return Err(ImputationError::config(
                "formal_care.min_hours must be finite and non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(ImputationError::config(
                "failure_threshold must be in [0, 1]",
            ));
        }
        if self.workers == 0 {
            return Err(ImputationError::config("workers must be at least 1"));
        }
        Ok(())
    }
}

impl fmt::Display for StudyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Study Configuration:")?;
        writeln!(f, "  Study: {}", self.study_id)?;
        writeln!(f, "  Imputations (M): {}", self.imputations)?;
        writeln!(f, "  Seed: {}", self.seed)?;
        writeln!(f, "  Max Iterations: {}", self.max_iterations)?;
        writeln!(f, "  Max Weekly Care Hours: {}", self.max_weekly_care_hours)?;
        writeln!(
            f,
            "  Formal Care: >= {} hours, excluding {:?}",
            self.formal_care.min_hours, self.formal_care.exclusions
        )?;
        writeln!(f, "  Failure Threshold: {}", self.failure_threshold)?;
        writeln!(f, "  Storage Root: {}", self.storage_root.display())?;
        Ok(())
    }
}

/// Builder for constructing a study configuration
#[derive(Debug, Clone)]
pub struct StudyConfigBuilder {
    config: StudyConfig,
}

impl Default for StudyConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StudyConfigBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: StudyConfig::default(),
        }
    }

    #[must_use]
    pub fn study_id(mut self, study_id: impl Into<String>) -> Self {
        self.config.study_id = study_id.into();
        self
    }

    /// Set the number of completed datasets
    #[must_use]
    pub const fn imputations(mut self, imputations: usize) -> Self {
        self.config.imputations = imputations;
        self
    }

    /// Set the random seed
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    #[must_use]
    pub const fn allocation_tolerance(mut self, tolerance: f64) -> Self {
        self.config.allocation_tolerance = tolerance;
        self
    }

    #[must_use]
    pub const fn max_iterations(mut self, iterations: usize) -> Self {
        self.config.max_iterations = iterations;
        self
    }

    #[must_use]
    pub const fn convergence_tolerance(mut self, tolerance: f64) -> Self {
        self.config.convergence_tolerance = tolerance;
        self
    }

    #[must_use]
    pub const fn fit_time_budget_secs(mut self, secs: u64) -> Self {
        self.config.fit_time_budget_secs = secs;
        self
    }

    #[must_use]
    pub const fn max_weekly_care_hours(mut self, hours: f64) -> Self {
        self.config.max_weekly_care_hours = hours;
        self
    }

    #[must_use]
    pub fn formal_care(mut self, rule: FormalCareRule) -> Self {
        self.config.formal_care = rule;
        self
    }

    #[must_use]
    pub const fn failure_threshold(mut self, threshold: f64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    #[must_use]
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage_root = root.into();
        self
    }

    #[must_use]
    pub const fn resume(mut self, resume: bool) -> Self {
        self.config.resume = resume;
        self
    }

    #[must_use]
    pub const fn show_progress(mut self, show: bool) -> Self {
        self.config.show_progress = show;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<StudyConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//! Pluggable imputation models
//!
//! Each imputed variable is handled by an `Imputer` that is fitted on the
//! observed rows of one completed world and then sampled once per missing
//! cell. Stages only see the two traits below; which strategy runs for which
//! variable is decided by the `ImputerRegistry`.

pub mod encoder;
pub mod linear;
pub mod marginal;
pub mod registry;
pub mod tree;

use std::fmt;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Value;

pub use encoder::FeatureEncoder;
pub use linear::{LinearGaussianImputer, OrdinalRegressionImputer, PredictiveMeanMatchingImputer};
pub use marginal::MarginalImputer;
pub use registry::ImputerRegistry;
pub use tree::{ClassificationTreeImputer, TreeParams};

/// Model family recorded in the metadata table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    AllocationSampling,
    PredictiveMeanMatching,
    LinearGaussian,
    OrdinalRegression,
    ClassificationTree,
    Marginal,
    Deterministic,
}

impl ModelFamily {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AllocationSampling => "allocation_sampling",
            Self::PredictiveMeanMatching => "predictive_mean_matching",
            Self::LinearGaussian => "linear_gaussian",
            Self::OrdinalRegression => "ordinal_regression",
            Self::ClassificationTree => "classification_tree",
            Self::Marginal => "marginal",
            Self::Deterministic => "deterministic",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a model could not be fitted or sampled
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("no observed rows to fit on")]
    NoTrainingData,
    #[error("design matrix is singular")]
    Singular,
    #[error("non-finite estimate: {0}")]
    NonFinite(String),
    #[error("value '{0}' is not a declared level")]
    UnknownLevel(String),
    #[error("target value {0:?} does not match the variable kind")]
    WrongKind(Value),
    #[error("expected {expected} features, got {actual}")]
    FeatureWidth { expected: usize, actual: usize },
}

/// Observed rows a model is fitted on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingData {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<Value>,
}

impl TrainingData {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            features: Vec::with_capacity(capacity),
            targets: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, features: Vec<f64>, target: Value) {
        self.features.push(features);
        self.targets.push(target);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Width of the feature vectors, zero when empty
    #[must_use]
    pub fn width(&self) -> usize {
        self.features.first().map_or(0, Vec::len)
    }
}

/// A strategy that can be fitted for one variable
pub trait Imputer: Send + Sync + fmt::Debug {
    /// Family name recorded alongside the stored imputations
    fn family(&self) -> ModelFamily;

    /// Fit on observed rows
    ///
    /// `rng` is the stream of this fit; strategies that draw their
    /// parameters from a posterior take it from here.
    fn fit(&self, data: &TrainingData, rng: &mut StdRng)
    -> Result<Box<dyn FittedImputer>, FitError>;
}

/// A fitted model producing one draw per call
pub trait FittedImputer: Send + Sync {
    /// Draw a completed value from the predictive distribution
    fn sample(&self, features: &[f64], rng: &mut StdRng) -> Result<Value, FitError>;
}

pub(crate) fn check_width(expected: usize, features: &[f64]) -> Result<(), FitError> {
    if features.len() == expected {
        Ok(())
    } else {
        Err(FitError::FeatureWidth {
            expected,
            actual: features.len(),
        })
    }
}

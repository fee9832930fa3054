//! Unconditional fallback imputer
//!
//! Draws from the empirical distribution of the observed values and ignores
//! the predictors. Used to initialize chained equations and as the single
//! fallback after a convergence failure.

use rand::Rng;
use rand::rngs::StdRng;

use super::{FitError, FittedImputer, Imputer, ModelFamily, TrainingData};
use crate::algorithm::sampling::draw_weighted;
use crate::models::{Value, VariableKind, VariableSpec};

#[derive(Debug, Clone)]
pub struct MarginalImputer {
    kind: VariableKind,
}

impl MarginalImputer {
    #[must_use]
    pub const fn new(spec: &VariableSpec) -> Self {
        Self { kind: spec.kind }
    }

    /// Fit directly on observed values, skipping the feature matrix
    pub fn fit_values(&self, observed: &[Value]) -> Result<FittedMarginal, FitError> {
        if observed.is_empty() {
            return Err(FitError::NoTrainingData);
        }
        if let Some(bad) = observed.iter().find(|v| !v.matches_kind(self.kind)) {
            return Err(FitError::WrongKind(bad.clone()));
        }

        let fitted = match self.kind {
            VariableKind::Continuous => FittedMarginal::HotDeck(
                observed.iter().filter_map(Value::as_number).collect(),
            ),
            _ => {
                let mut levels: Vec<Value> = Vec::new();
                let mut weights: Vec<f64> = Vec::new();
                for value in observed {
                    match levels.iter().position(|l| l == value) {
                        Some(i) => weights[i] += 1.0,
                        None => {
                            levels.push(value.clone());
                            weights.push(1.0);
                        }
                    }
                }
                FittedMarginal::Frequencies { levels, weights }
            }
        };
        Ok(fitted)
    }
}

/// Empirical distribution of one variable
#[derive(Debug, Clone, PartialEq)]
pub enum FittedMarginal {
    HotDeck(Vec<f64>),
    Frequencies { levels: Vec<Value>, weights: Vec<f64> },
}

impl FittedMarginal {
    pub fn draw(&self, rng: &mut StdRng) -> Result<Value, FitError> {
        match self {
            Self::HotDeck(values) => {
                if values.is_empty() {
                    return Err(FitError::NoTrainingData);
                }
                Ok(Value::Number(values[rng.random_range(0..values.len())]))
            }
            Self::Frequencies { levels, weights } => draw_weighted(weights, rng)
                .map(|i| levels[i].clone())
                .ok_or(FitError::NoTrainingData),
        }
    }
}

impl Imputer for MarginalImputer {
    fn family(&self) -> ModelFamily {
        ModelFamily::Marginal
    }

    fn fit(
        &self,
        data: &TrainingData,
        _rng: &mut StdRng,
    ) -> Result<Box<dyn FittedImputer>, FitError> {
        Ok(Box::new(self.fit_values(&data.targets)?))
    }
}

impl FittedImputer for FittedMarginal {
    fn sample(&self, _features: &[f64], rng: &mut StdRng) -> Result<Value, FitError> {
        self.draw(rng)
    }
}

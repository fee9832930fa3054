//! Least-squares based imputers
//!
//! Three strategies share one ridge-stabilized least-squares fit on
//! standardized features. Each fit draws its coefficients and residual
//! spread from their posterior given the observed rows, so parameter
//! uncertainty varies between completed worlds:
//!
//! - `PredictiveMeanMatchingImputer` draws an observed donor value among the
//!   rows whose estimated means are closest to the drawn-model prediction.
//! - `LinearGaussianImputer` adds Gaussian residual noise to the predicted
//!   mean. Draws are unbounded; range checks belong to the caller.
//! - `OrdinalRegressionImputer` regresses the level index and rounds the
//!   noisy prediction back onto the declared levels.

use rand::Rng;
use rand::rngs::StdRng;

use super::{FitError, FittedImputer, Imputer, ModelFamily, TrainingData, check_width};
use crate::algorithm::sampling::standard_normal;
use crate::models::{Value, VariableSpec};

/// Ridge penalty applied to the standardized slope coefficients
const RIDGE_PENALTY: f64 = 1e-3;
const PIVOT_EPSILON: f64 = 1e-12;

/// Donor pool size for predictive mean matching
pub const PMM_DONORS: usize = 5;

/// Fitted linear predictor with its residual spread
#[derive(Debug, Clone, PartialEq)]
pub struct LeastSquares {
    means: Vec<f64>,
    scales: Vec<f64>,
    /// Intercept first, then one coefficient per standardized feature
    coefficients: Vec<f64>,
    residual_sd: f64,
    /// Cholesky factor of the penalized cross-product matrix
    cholesky: Vec<Vec<f64>>,
    /// Residual degrees of freedom, zero when `n <= p`
    dof: usize,
}

impl LeastSquares {
    /// Fit `y ~ X` with a small ridge penalty on the slopes
    pub fn fit(features: &[Vec<f64>], targets: &[f64]) -> Result<Self, FitError> {
        let n = targets.len();
        if n == 0 || features.len() != n {
            return Err(FitError::NoTrainingData);
        }
        let k = features[0].len();
        if let Some(row) = features.iter().find(|row| row.len() != k) {
            return Err(FitError::FeatureWidth {
                expected: k,
                actual: row.len(),
            });
        }
        if targets.iter().any(|y| !y.is_finite())
            || features.iter().flatten().any(|x| !x.is_finite())
        {
            return Err(FitError::NonFinite("training data".to_string()));
        }

        let mut means = vec![0.0; k];
        let mut scales = vec![1.0; k];
        for j in 0..k {
            let mean = features.iter().map(|r| r[j]).sum::<f64>() / n as f64;
            let var = features.iter().map(|r| (r[j] - mean).powi(2)).sum::<f64>() / n as f64;
            means[j] = mean;
            scales[j] = if var > 0.0 { var.sqrt() } else { 0.0 };
        }

        let p = k + 1;
        let mut xtx = vec![vec![0.0; p]; p];
        let mut xty = vec![0.0; p];
        let mut row = vec![0.0; p];
        for (x, &y) in features.iter().zip(targets) {
            standardize_into(x, &means, &scales, &mut row);
            for a in 0..p {
                xty[a] += row[a] * y;
                for b in a..p {
                    xtx[a][b] += row[a] * row[b];
                }
            }
        }
        for a in 0..p {
            for b in 0..a {
                xtx[a][b] = xtx[b][a];
            }
            if a > 0 {
                xtx[a][a] += RIDGE_PENALTY * n as f64;
            }
        }

        let cholesky = cholesky(&xtx)?;
        let coefficients = solve(xtx, xty)?;

        let mut rss = 0.0;
        for (x, &y) in features.iter().zip(targets) {
            standardize_into(x, &means, &scales, &mut row);
            let fitted: f64 = row.iter().zip(&coefficients).map(|(a, b)| a * b).sum();
            rss += (y - fitted).powi(2);
        }
        let residual_sd = if n > p {
            (rss / (n - p) as f64).sqrt()
        } else {
            let mean = targets.iter().sum::<f64>() / n as f64;
            (targets.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n as f64).sqrt()
        };

        if !residual_sd.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
            return Err(FitError::NonFinite("coefficients".to_string()));
        }

        Ok(Self {
            means,
            scales,
            coefficients,
            residual_sd,
            cholesky,
            dof: n.saturating_sub(p),
        })
    }

    /// Draw coefficients and residual spread from their posterior
    ///
    /// `sigma* = sigma * sqrt(dof / chi2(dof))` and
    /// `beta* = beta + sigma* * L^-T z` with `L L^T` the penalized
    /// cross-product. Without residual degrees of freedom the estimate is
    /// returned unchanged.
    pub fn draw_parameters(&self, rng: &mut StdRng) -> Result<Self, FitError> {
        if self.dof == 0 {
            return Ok(self.clone());
        }
        let chi2: f64 = (0..self.dof).map(|_| standard_normal(rng).powi(2)).sum();
        let residual_sd = self.residual_sd * (self.dof as f64 / chi2).sqrt();

        let z: Vec<f64> = (0..self.coefficients.len())
            .map(|_| standard_normal(rng))
            .collect();
        let offset = solve_upper_transposed(&self.cholesky, &z);
        let coefficients: Vec<f64> = self
            .coefficients
            .iter()
            .zip(&offset)
            .map(|(b, v)| b + residual_sd * v)
            .collect();

        if !residual_sd.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
            return Err(FitError::NonFinite("parameter draw".to_string()));
        }
        Ok(Self {
            coefficients,
            residual_sd,
            ..self.clone()
        })
    }

    /// Number of raw features expected by `predict`
    #[must_use]
    pub fn width(&self) -> usize {
        self.means.len()
    }

    #[must_use]
    pub const fn residual_sd(&self) -> f64 {
        self.residual_sd
    }

    /// Predicted mean for a raw feature vector
    #[must_use]
    pub fn predict(&self, features: &[f64]) -> f64 {
        let mut value = self.coefficients[0];
        for (j, x) in features.iter().enumerate() {
            if self.scales[j] > 0.0 {
                value += self.coefficients[j + 1] * (x - self.means[j]) / self.scales[j];
            }
        }
        value
    }
}

fn standardize_into(x: &[f64], means: &[f64], scales: &[f64], out: &mut [f64]) {
    out[0] = 1.0;
    for j in 0..x.len() {
        out[j + 1] = if scales[j] > 0.0 {
            (x[j] - means[j]) / scales[j]
        } else {
            0.0
        };
    }
}

/// Lower-triangular `L` with `L L^T = a`
fn cholesky(a: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, FitError> {
    let n = a.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let dot: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = a[i][i] - dot;
                if d <= PIVOT_EPSILON {
                    return Err(FitError::Singular);
                }
                l[i][i] = d.sqrt();
            } else {
                l[i][j] = (a[i][j] - dot) / l[j][j];
            }
        }
    }
    Ok(l)
}

/// Solve `L^T v = z` for lower-triangular `L`
fn solve_upper_transposed(l: &[Vec<f64>], z: &[f64]) -> Vec<f64> {
    let n = z.len();
    let mut v = vec![0.0; n];
    for i in (0..n).rev() {
        let tail: f64 = ((i + 1)..n).map(|k| l[k][i] * v[k]).sum();
        v[i] = (z[i] - tail) / l[i][i];
    }
    v
}

/// Gaussian elimination with partial pivoting
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, FitError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return Err(FitError::Singular);
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}

fn numeric_targets(data: &TrainingData) -> Result<Vec<f64>, FitError> {
    data.targets
        .iter()
        .map(|v| v.as_number().ok_or_else(|| FitError::WrongKind(v.clone())))
        .collect()
}

/// Predictive mean matching for continuous variables
#[derive(Debug, Clone)]
pub struct PredictiveMeanMatchingImputer {
    donors: usize,
}

impl Default for PredictiveMeanMatchingImputer {
    fn default() -> Self {
        Self { donors: PMM_DONORS }
    }
}

impl PredictiveMeanMatchingImputer {
    #[must_use]
    pub fn with_donors(donors: usize) -> Self {
        Self {
            donors: donors.max(1),
        }
    }
}

struct FittedPmm {
    /// Drawn model used for the cells being imputed
    model: LeastSquares,
    /// (estimated mean, observed value), sorted by estimated mean
    pool: Vec<(f64, f64)>,
    donors: usize,
}

impl Imputer for PredictiveMeanMatchingImputer {
    fn family(&self) -> ModelFamily {
        ModelFamily::PredictiveMeanMatching
    }

    fn fit(
        &self,
        data: &TrainingData,
        rng: &mut StdRng,
    ) -> Result<Box<dyn FittedImputer>, FitError> {
        let targets = numeric_targets(data)?;
        let estimate = LeastSquares::fit(&data.features, &targets)?;
        let mut pool: Vec<(f64, f64)> = data
            .features
            .iter()
            .zip(&targets)
            .map(|(x, &y)| (estimate.predict(x), y))
            .collect();
        pool.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
        Ok(Box::new(FittedPmm {
            model: estimate.draw_parameters(rng)?,
            pool,
            donors: self.donors,
        }))
    }
}

impl FittedImputer for FittedPmm {
    fn sample(&self, features: &[f64], rng: &mut StdRng) -> Result<Value, FitError> {
        check_width(self.model.width(), features)?;
        let target = self.model.predict(features);
        if !target.is_finite() {
            return Err(FitError::NonFinite("predicted mean".to_string()));
        }

        // Grow a window of the closest predicted means around the insertion point
        let k = self.donors.min(self.pool.len());
        let split = self.pool.partition_point(|(p, _)| *p < target);
        let (mut lo, mut hi) = (split, split);
        while hi - lo < k {
            let take_left = match (lo.checked_sub(1), (hi < self.pool.len()).then_some(hi)) {
                (Some(l), Some(h)) => (target - self.pool[l].0) <= (self.pool[h].0 - target),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if take_left {
                lo -= 1;
            } else {
                hi += 1;
            }
        }
        let donor = rng.random_range(lo..hi);
        Ok(Value::Number(self.pool[donor].1))
    }
}

/// Normal linear model for unbounded continuous draws
#[derive(Debug, Clone, Default)]
pub struct LinearGaussianImputer;

struct FittedLinearGaussian {
    model: LeastSquares,
}

impl Imputer for LinearGaussianImputer {
    fn family(&self) -> ModelFamily {
        ModelFamily::LinearGaussian
    }

    fn fit(
        &self,
        data: &TrainingData,
        rng: &mut StdRng,
    ) -> Result<Box<dyn FittedImputer>, FitError> {
        let targets = numeric_targets(data)?;
        let model = LeastSquares::fit(&data.features, &targets)?.draw_parameters(rng)?;
        Ok(Box::new(FittedLinearGaussian { model }))
    }
}

impl FittedImputer for FittedLinearGaussian {
    fn sample(&self, features: &[f64], rng: &mut StdRng) -> Result<Value, FitError> {
        check_width(self.model.width(), features)?;
        let noise = self.model.residual_sd() * standard_normal(rng);
        let draw = self.model.predict(features) + noise;
        if draw.is_finite() {
            Ok(Value::Number(draw))
        } else {
            Err(FitError::NonFinite("linear draw".to_string()))
        }
    }
}

/// Regression on the level index of an ordinal variable
#[derive(Debug, Clone)]
pub struct OrdinalRegressionImputer {
    levels: Vec<String>,
}

impl OrdinalRegressionImputer {
    #[must_use]
    pub fn new(spec: &VariableSpec) -> Self {
        Self {
            levels: spec.levels.clone(),
        }
    }
}

struct FittedOrdinal {
    model: LeastSquares,
    levels: Vec<String>,
}

impl Imputer for OrdinalRegressionImputer {
    fn family(&self) -> ModelFamily {
        ModelFamily::OrdinalRegression
    }

    fn fit(
        &self,
        data: &TrainingData,
        rng: &mut StdRng,
    ) -> Result<Box<dyn FittedImputer>, FitError> {
        let targets = data
            .targets
            .iter()
            .map(|v| {
                let level = v.as_category().ok_or_else(|| FitError::WrongKind(v.clone()))?;
                self.levels
                    .iter()
                    .position(|l| l == level)
                    .map(|i| i as f64)
                    .ok_or_else(|| FitError::UnknownLevel(level.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let model = LeastSquares::fit(&data.features, &targets)?.draw_parameters(rng)?;
        Ok(Box::new(FittedOrdinal {
            model,
            levels: self.levels.clone(),
        }))
    }
}

impl FittedImputer for FittedOrdinal {
    fn sample(&self, features: &[f64], rng: &mut StdRng) -> Result<Value, FitError> {
        check_width(self.model.width(), features)?;
        let noise = self.model.residual_sd() * standard_normal(rng);
        let draw = self.model.predict(features) + noise;
        if !draw.is_finite() {
            return Err(FitError::NonFinite("ordinal draw".to_string()));
        }
        let top = (self.levels.len() - 1) as f64;
        let idx = draw.round().clamp(0.0, top) as usize;
        Ok(Value::category(self.levels[idx].clone()))
    }
}

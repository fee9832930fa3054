//! Allocation string parsing
//!
//! An allocation string lists the candidate geographic units for an ambiguous
//! record together with their allocation factors, e.g. `06037:0.7;06059:0.3`.
//! Parsing validates the weights and yields a normalized distribution that the
//! sampler draws from.

use smallvec::SmallVec;

use crate::algorithm::sampling::draw_index;
use crate::error::{ImputationError, Result};
use rand::Rng;

/// A candidate unit and its normalized probability
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub unit: String,
    pub probability: f64,
}

/// Validated probability distribution over candidate units
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationDistribution {
    candidates: SmallVec<[Candidate; 4]>,
    cumulative: SmallVec<[f64; 4]>,
}

impl AllocationDistribution {
    /// Parse a `unit:weight;unit:weight` string
    ///
    /// # Errors
    /// Returns a parse error on malformed syntax, negative or non-finite
    /// weights, duplicate units, or a weight sum further than `tolerance`
    /// from one.
    pub fn parse(input: &str, tolerance: f64) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ImputationError::parse(input, "empty allocation"));
        }
        let body = trimmed.strip_suffix(';').unwrap_or(trimmed);

        let mut candidates: SmallVec<[Candidate; 4]> = SmallVec::new();
        for (position, pair) in body.split(';').enumerate() {
            let Some((unit, weight)) = pair.split_once(':') else {
                return Err(ImputationError::parse(
                    input,
                    format!("entry {} '{}' is not unit:weight", position + 1, pair.trim()),
                ));
            };
            let unit = unit.trim();
            if unit.is_empty() {
                return Err(ImputationError::parse(
                    input,
                    format!("entry {} has an empty unit", position + 1),
                ));
            }
            let weight: f64 = weight.trim().parse().map_err(|_| {
                ImputationError::parse(
                    input,
                    format!("weight '{}' for unit '{unit}' is not a number", weight.trim()),
                )
            })?;
            if !weight.is_finite() {
                return Err(ImputationError::parse(
                    input,
                    format!("weight for unit '{unit}' is not finite"),
                ));
            }
            if weight < 0.0 {
                return Err(ImputationError::parse(
                    input,
                    format!("negative weight {weight} for unit '{unit}'"),
                ));
            }
            if candidates.iter().any(|c| c.unit == unit) {
                return Err(ImputationError::parse(
                    input,
                    format!("unit '{unit}' listed more than once"),
                ));
            }
            candidates.push(Candidate {
                unit: unit.to_string(),
                probability: weight,
            });
        }

        let total: f64 = candidates.iter().map(|c| c.probability).sum();
        if (total - 1.0).abs() > tolerance || total <= 0.0 {
            return Err(ImputationError::parse(
                input,
                format!("weights sum to {total}, expected 1 within {tolerance}"),
            ));
        }

        let mut cumulative = SmallVec::with_capacity(candidates.len());
        let mut running = 0.0;
        for candidate in &mut candidates {
            candidate.probability /= total;
            running += candidate.probability;
            cumulative.push(running);
        }

        Ok(Self {
            candidates,
            cumulative,
        })
    }

    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// The single unit carrying all the weight, if there is one
    #[must_use]
    pub fn determined_unit(&self) -> Option<&str> {
        let mut positive = self.candidates.iter().filter(|c| c.probability > 0.0);
        match (positive.next(), positive.next()) {
            (Some(only), None) => Some(only.unit.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_determined(&self) -> bool {
        self.determined_unit().is_some()
    }

    /// Draw one unit by inverse-CDF sampling
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        let idx = draw_index(&self.cumulative, rng);
        &self.candidates[idx].unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_parse_valid_allocation() {
        let dist = AllocationDistribution::parse(" A:0.7 ; B:0.3 ;", 1e-3).unwrap();
        assert_eq!(dist.candidates().len(), 2);
        assert_eq!(dist.candidates()[0].unit, "A");
        assert!((dist.candidates()[1].probability - 0.3).abs() < 1e-12);
        assert!(!dist.is_determined());
    }

    #[test]
    fn test_parse_renormalizes_within_tolerance() {
        let dist = AllocationDistribution::parse("A:0.5004;B:0.5", 1e-3).unwrap();
        let total: f64 = dist.candidates().iter().map(|c| c.probability).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_errors() {
        let cases = [
            "",
            "A0.5;B:0.5",
            ":1.0",
            "A:abc",
            "A:-0.2;B:1.2",
            "A:0.5;A:0.5",
            "A:0.6;B:0.3",
            "A:inf",
        ];
        for case in cases {
            let result = AllocationDistribution::parse(case, 1e-3);
            assert!(
                matches!(result, Err(ImputationError::Parse { .. })),
                "expected parse error for {case:?}"
            );
        }
    }

    #[test]
    fn test_single_unit_is_determined() {
        let dist = AllocationDistribution::parse("06037:1.0", 1e-3).unwrap();
        assert_eq!(dist.determined_unit(), Some("06037"));

        let dist = AllocationDistribution::parse("06037:1.0;06059:0", 1e-3).unwrap();
        assert_eq!(dist.determined_unit(), Some("06037"));
    }

    #[test]
    fn test_zero_weight_unit_never_drawn() {
        let dist = AllocationDistribution::parse("A:0;B:0.5;C:0.5", 1e-3).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2000 {
            assert_ne!(dist.sample(&mut rng), "A");
        }
    }
}

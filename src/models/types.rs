//! Core value types shared by every stage
//!
//! This module defines the typed imputation index, the value representation
//! for observed and imputed cells, and the variable kind/group enums that
//! drive model selection and storage column types.

use std::fmt;
use std::num::NonZeroU32;

use arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};

use crate::error::{ImputationError, Result};

/// Identifies one internally consistent completed world, `m ∈ {1..M}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ImputationIndex(NonZeroU32);

impl ImputationIndex {
    /// Create an index, rejecting zero
    pub fn new(m: u32) -> Result<Self> {
        NonZeroU32::new(m)
            .map(Self)
            .ok_or_else(|| ImputationError::validation("imputation index must be >= 1"))
    }

    /// The first completed world
    #[must_use]
    pub const fn first() -> Self {
        Self(NonZeroU32::MIN)
    }

    /// Raw 1-based value
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Zero-based position, for indexing per-m vectors
    #[must_use]
    pub const fn position(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Iterate `1..=count`
    pub fn all(count: usize) -> impl Iterator<Item = Self> + Clone {
        (1..=count as u32).filter_map(NonZeroU32::new).map(Self)
    }
}

impl TryFrom<u32> for ImputationIndex {
    type Error = ImputationError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ImputationIndex> for u32 {
    fn from(value: ImputationIndex) -> Self {
        value.get()
    }
}

impl fmt::Display for ImputationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An observed or imputed cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Category(String),
    Flag(bool),
}

impl Value {
    /// Convenience constructor for categorical values
    pub fn category(value: impl Into<String>) -> Self {
        Self::Category(value.into())
    }

    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_category(&self) -> Option<&str> {
        match self {
            Self::Category(v) => Some(v.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(v) => Some(*v),
            _ => None,
        }
    }

    /// A value that would have to be written as NULL
    #[must_use]
    pub fn is_null_like(&self) -> bool {
        match self {
            Self::Number(v) => !v.is_finite(),
            Self::Category(v) => v.is_empty(),
            Self::Flag(_) => false,
        }
    }

    /// Check that this value can live in a column of the given kind
    #[must_use]
    pub const fn matches_kind(&self, kind: VariableKind) -> bool {
        matches!(
            (self, kind),
            (Self::Number(_), VariableKind::Continuous)
                | (
                    Self::Category(_),
                    VariableKind::Categorical | VariableKind::Ordinal
                )
                | (Self::Flag(_), VariableKind::Indicator)
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Category(v) => write!(f, "{v}"),
            Self::Flag(v) => write!(f, "{v}"),
        }
    }
}

/// Measurement family of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Continuous,
    Categorical,
    Ordinal,
    Indicator,
}

impl VariableKind {
    /// Arrow type used for this kind in base and imputation tables
    #[must_use]
    pub const fn data_type(self) -> DataType {
        match self {
            Self::Continuous => DataType::Float64,
            Self::Categorical | Self::Ordinal => DataType::Utf8,
            Self::Indicator => DataType::Boolean,
        }
    }
}

/// Position of a variable in the dependency graph
///
/// Ordering follows the graph: a group may only read groups that compare
/// lower than itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableGroup {
    /// Observed fields that are never imputed
    Deterministic,
    Geography,
    Sociodemographic,
    Childcare,
    Derived,
}

impl fmt::Display for VariableGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deterministic => "deterministic",
            Self::Geography => "geography",
            Self::Sociodemographic => "sociodemographic",
            Self::Childcare => "childcare",
            Self::Derived => "derived",
        };
        f.write_str(name)
    }
}

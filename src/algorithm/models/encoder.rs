//! Predictor encoding
//!
//! Turns the predictor variables of a completed record into the numeric
//! vector the models consume. The encoder is fitted once per completed world
//! so that every model in that world sees the same column layout.

use itertools::Itertools;
use rustc_hash::FxHashMap;

use crate::models::{CompletedRecord, Value, VariableKind, VariableSpec};

/// Most frequent levels kept as one-hot columns per categorical predictor
pub const MAX_ONE_HOT_LEVELS: usize = 24;

#[derive(Debug, Clone, PartialEq)]
enum Column {
    Numeric { variable: String, fill: f64 },
    Ordinal { variable: String, levels: Vec<String>, fill: f64 },
    Flag { variable: String, fill: f64 },
    OneHot { variable: String, levels: Vec<String> },
}

/// Column plan built from the predictor variables of one completed world
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureEncoder {
    columns: Vec<Column>,
    width: usize,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

impl FeatureEncoder {
    /// Build the plan from the records that will be encoded
    ///
    /// Missing numeric, ordinal, and flag inputs are filled with the column
    /// mean; missing or rare categorical inputs encode as all zeros.
    #[must_use]
    pub fn fit(records: &[&CompletedRecord], predictors: &[&VariableSpec]) -> Self {
        let mut columns = Vec::with_capacity(predictors.len());
        let mut width = 0;

        for spec in predictors {
            let name = spec.name.clone();
            let observed = records.iter().filter_map(|r| r.get(&spec.name));
            match spec.kind {
                VariableKind::Continuous => {
                    let fill = mean(observed.filter_map(Value::as_number));
                    columns.push(Column::Numeric { variable: name, fill });
                    width += 1;
                }
                VariableKind::Ordinal => {
                    let fill = mean(
                        observed
                            .filter_map(Value::as_category)
                            .filter_map(|l| spec.level_index(l))
                            .map(|i| i as f64),
                    );
                    columns.push(Column::Ordinal {
                        variable: name,
                        levels: spec.levels.clone(),
                        fill,
                    });
                    width += 1;
                }
                VariableKind::Indicator => {
                    let fill = mean(
                        observed
                            .filter_map(Value::as_flag)
                            .map(|f| if f { 1.0 } else { 0.0 }),
                    );
                    columns.push(Column::Flag { variable: name, fill });
                    width += 1;
                }
                VariableKind::Categorical => {
                    let mut counts: FxHashMap<&str, usize> = FxHashMap::default();
                    for level in observed.filter_map(Value::as_category) {
                        *counts.entry(level).or_insert(0) += 1;
                    }
                    let levels: Vec<String> = counts
                        .into_iter()
                        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)))
                        .take(MAX_ONE_HOT_LEVELS)
                        .map(|(level, _)| level.to_string())
                        .collect();
                    width += levels.len();
                    columns.push(Column::OneHot { variable: name, levels });
                }
            }
        }

        Self { columns, width }
    }

    /// Number of features produced per record
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Encode one record
    #[must_use]
    pub fn encode(&self, record: &CompletedRecord) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.width);
        for column in &self.columns {
            match column {
                Column::Numeric { variable, fill } => {
                    out.push(record.get(variable).and_then(Value::as_number).unwrap_or(*fill));
                }
                Column::Ordinal {
                    variable,
                    levels,
                    fill,
                } => {
                    let idx = record
                        .get(variable)
                        .and_then(Value::as_category)
                        .and_then(|l| levels.iter().position(|x| x == l));
                    out.push(idx.map_or(*fill, |i| i as f64));
                }
                Column::Flag { variable, fill } => {
                    let flag = record.get(variable).and_then(Value::as_flag);
                    out.push(flag.map_or(*fill, |f| if f { 1.0 } else { 0.0 }));
                }
                Column::OneHot { variable, levels } => {
                    let value = record.get(variable).and_then(Value::as_category);
                    out.extend(
                        levels
                            .iter()
                            .map(|l| if Some(l.as_str()) == value { 1.0 } else { 0.0 }),
                    );
                }
            }
        }
        out
    }
}

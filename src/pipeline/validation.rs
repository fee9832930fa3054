//! Stage output checks
//!
//! Run on every stage output before anything is stored. A violation here is
//! a defect in a stage, not a data problem, so it fails the run instead of
//! being recorded as an issue.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::algorithm::stages::{StageKind, StageOutput};
use crate::error::{ImputationError, Result};
use crate::models::{
    CompletedDataset, ImputationIndex, ImputedValueRow, RECEIVES_CARE_YES, Value, VariableCatalog,
};

/// Check a stage output against the worlds it was computed from
pub fn validate_stage(
    output: &StageOutput,
    worlds: &[CompletedDataset],
    catalog: &VariableCatalog,
) -> Result<()> {
    for (variable, rows) in &output.rows {
        validate_rows(variable, rows, worlds, catalog)?;
    }
    if output.stage == Some(StageKind::Childcare) {
        validate_conditional_existence(output, worlds, catalog)?;
        validate_indicator(output, worlds, catalog)?;
    }
    Ok(())
}

fn validate_rows(
    variable: &str,
    rows: &[ImputedValueRow],
    worlds: &[CompletedDataset],
    catalog: &VariableCatalog,
) -> Result<()> {
    let spec = catalog.require(variable)?;
    let mut seen: FxHashSet<(&str, ImputationIndex)> = FxHashSet::default();

    for row in rows {
        let fail = |message: &str| {
            Err(ImputationError::validation(format!(
                "'{variable}' row for record '{}' at m={}: {message}",
                row.record_id, row.imputation
            )))
        };

        if row.value.is_null_like() {
            return fail("NULL value");
        }
        if !row.value.matches_kind(spec.kind) {
            return fail(&format!("value {:?} does not match {:?}", row.value, spec.kind));
        }
        if !seen.insert((row.record_id.as_str(), row.imputation)) {
            return fail("duplicate (record, m)");
        }
        let Some(world) = worlds.get(row.imputation.position()) else {
            return fail(&format!("m beyond M={}", worlds.len()));
        };
        let Some(record) = world.record(&row.record_id) else {
            return fail("unknown record");
        };
        if !record.included {
            return fail("record is excluded from imputation");
        }
        if record.get(variable).is_some() {
            return fail("value was already determined");
        }
    }
    Ok(())
}

/// Care details exist in a world exactly where the gate answer is "Yes"
fn validate_conditional_existence(
    output: &StageOutput,
    worlds: &[CompletedDataset],
    catalog: &VariableCatalog,
) -> Result<()> {
    let roles = catalog.childcare();
    let gate_rows = rows_by_cell(output, &roles.receives_care);
    let issue_cells: FxHashSet<(&str, &str, ImputationIndex)> = output
        .issues
        .iter()
        .filter_map(|i| Some((i.variable.as_str(), i.record_id.as_deref()?, i.imputation?)))
        .collect();

    for variable in [&roles.care_type, &roles.care_hours] {
        let detail_rows = rows_by_cell(output, variable);
        for world in worlds {
            let m = world.imputation();
            for record in world.records().iter().filter(|r| r.included) {
                let id = record.record_id.as_str();
                let gate = gate_rows
                    .get(&(id, m))
                    .copied()
                    .or_else(|| record.get(&roles.receives_care));
                let receiving = gate.and_then(Value::as_category) == Some(RECEIVES_CARE_YES);
                let imputed = detail_rows.contains_key(&(id, m));

                if imputed && !receiving {
                    return Err(ImputationError::validation(format!(
                        "'{variable}' imputed for record '{id}' at m={m} \
                         without a \"{RECEIVES_CARE_YES}\" answer"
                    )));
                }
                let unaccounted = receiving
                    && !imputed
                    && record.get(variable).is_none()
                    && !issue_cells.contains(&(variable.as_str(), id, m));
                if unaccounted {
                    return Err(ImputationError::validation(format!(
                        "'{variable}' for receiving record '{id}' at m={m} \
                         has neither a value nor an issue"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Indicator rows only where both care type and hours are completed
fn validate_indicator(
    output: &StageOutput,
    worlds: &[CompletedDataset],
    catalog: &VariableCatalog,
) -> Result<()> {
    let roles = catalog.childcare();
    let Some(rows) = output.rows.get(&roles.indicator) else {
        return Ok(());
    };
    let inputs = [
        (&roles.care_type, rows_by_cell(output, &roles.care_type)),
        (&roles.care_hours, rows_by_cell(output, &roles.care_hours)),
    ];
    for row in rows {
        let id = row.record_id.as_str();
        let world = worlds.get(row.imputation.position());
        for (variable, imputed) in &inputs {
            let completed = imputed.contains_key(&(id, row.imputation))
                || world.and_then(|w| w.value(id, variable)).is_some();
            if !completed {
                return Err(ImputationError::validation(format!(
                    "'{}' derived for record '{id}' at m={} without a completed '{variable}'",
                    roles.indicator, row.imputation
                )));
            }
        }
    }
    Ok(())
}

fn rows_by_cell<'a>(
    output: &'a StageOutput,
    variable: &str,
) -> FxHashMap<(&'a str, ImputationIndex), &'a Value> {
    output
        .rows
        .get(variable)
        .into_iter()
        .flatten()
        .map(|r| ((r.record_id.as_str(), r.imputation), &r.value))
        .collect()
}

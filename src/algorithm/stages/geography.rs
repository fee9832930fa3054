//! Geography stage
//!
//! Resolves ambiguous geographic units by drawing M units per record from
//! the record's allocation distribution. Records whose allocation is already
//! determined are left to the base dataset and produce no rows.

use log::{debug, warn};
use rayon::prelude::*;

use super::{Issue, IssueKind, StageContext, StageKind, StageOutput, WorldDraws};
use crate::algorithm::allocation::AllocationDistribution;
use crate::algorithm::models::ModelFamily;
use crate::algorithm::sampling::{SeedKey, stream_rng};
use crate::models::{
    BaseDataset, ImputationIndex, ImputedValueRow, SourceRecord, Value, VariableGroup,
};

/// Draw M units for every unresolved (record, geography variable) pair
pub fn run_geography(
    ctx: &StageContext<'_>,
    base: &BaseDataset,
    sources: &[SourceRecord],
) -> StageOutput {
    let geography: Vec<_> = ctx.catalog.group(VariableGroup::Geography).collect();
    let families = geography
        .iter()
        .map(|spec| (spec.name.clone(), ModelFamily::AllocationSampling))
        .collect();
    let mut output = StageOutput::new(StageKind::Geography, families);

    for spec in geography {
        let variable = spec.name.as_str();
        let per_record: Vec<WorldDraws> = sources
            .par_iter()
            .filter(|source| source.included)
            .filter(|source| {
                base.get(&source.record_id)
                    .is_some_and(|r| r.get(variable).is_none())
            })
            .map(|source| resolve_record(ctx, source, variable))
            .collect();

        let before = output.attempted;
        for draws in per_record {
            output.absorb(draws);
        }
        debug!(
            "Geography '{variable}': {} unresolved records",
            output.attempted - before
        );
        ctx.tick();
    }

    output.finish()
}

fn resolve_record(ctx: &StageContext<'_>, source: &SourceRecord, variable: &str) -> WorldDraws {
    let mut draws = WorldDraws {
        attempted: 1,
        ..WorldDraws::default()
    };

    let Some(raw) = source.allocations.get(variable) else {
        draws.issues.push(
            Issue::new(IssueKind::Parse, variable, "missing allocation string")
                .for_record(&source.record_id),
        );
        return draws;
    };

    let distribution = match AllocationDistribution::parse(raw, ctx.config.allocation_tolerance) {
        Ok(distribution) => distribution,
        Err(e) => {
            warn!(
                "Excluding record '{}' from '{variable}' imputation: {e}",
                source.record_id
            );
            draws.issues.push(
                Issue::new(IssueKind::Parse, variable, e.to_string()).for_record(&source.record_id),
            );
            return draws;
        }
    };

    // Determined allocations are filled into the base dataset
    if distribution.is_determined() {
        draws.attempted = 0;
        return draws;
    }

    for imputation in ImputationIndex::all(ctx.config.imputations) {
        let mut rng = stream_rng(
            ctx.config.seed,
            &SeedKey::new(&source.record_id, variable, imputation),
        );
        let unit = distribution.sample(&mut rng);
        draws.push(
            variable,
            ImputedValueRow::new(&source.record_id, imputation, Value::category(unit)),
        );
    }
    draws
}

//! Registry mapping variable names to imputers
//!
//! New variables register an implementation here instead of extending a
//! central dispatcher. `for_catalog` installs the default strategy per
//! variable kind; `register` overrides it.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    ClassificationTreeImputer, Imputer, LinearGaussianImputer, ModelFamily,
    OrdinalRegressionImputer, PredictiveMeanMatchingImputer,
};
use crate::error::{ImputationError, Result};
use crate::models::{VariableCatalog, VariableGroup, VariableKind, VariableSpec};

#[derive(Debug, Clone, Default)]
pub struct ImputerRegistry {
    imputers: BTreeMap<String, Arc<dyn Imputer>>,
}

impl ImputerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default strategies for every model-based variable in the catalog
    #[must_use]
    pub fn for_catalog(catalog: &VariableCatalog) -> Self {
        let mut registry = Self::new();
        let hours = &catalog.childcare().care_hours;
        for spec in catalog.variables() {
            if let Some(imputer) = default_imputer(spec, spec.name == *hours) {
                registry.register(&spec.name, imputer);
            }
        }
        registry
    }

    /// Register or replace the imputer of one variable
    pub fn register(
        &mut self,
        variable: &str,
        imputer: Arc<dyn Imputer>,
    ) -> Option<Arc<dyn Imputer>> {
        self.imputers.insert(variable.to_string(), imputer)
    }

    pub fn get(&self, variable: &str) -> Result<&Arc<dyn Imputer>> {
        self.imputers.get(variable).ok_or_else(|| {
            ImputationError::config(format!("No imputer registered for '{variable}'"))
        })
    }

    #[must_use]
    pub fn family(&self, variable: &str) -> Option<ModelFamily> {
        self.imputers.get(variable).map(|i| i.family())
    }

    /// Check every model-based variable in the catalog has an imputer
    pub fn validate(&self, catalog: &VariableCatalog) -> Result<()> {
        for spec in catalog.variables() {
            let model_based = matches!(
                spec.group,
                VariableGroup::Sociodemographic | VariableGroup::Childcare
            );
            if model_based {
                self.get(&spec.name)?;
            }
        }
        Ok(())
    }
}

fn default_imputer(spec: &VariableSpec, unbounded_continuous: bool) -> Option<Arc<dyn Imputer>> {
    if !matches!(
        spec.group,
        VariableGroup::Sociodemographic | VariableGroup::Childcare
    ) {
        return None;
    }
    let imputer: Arc<dyn Imputer> = match spec.kind {
        VariableKind::Continuous if unbounded_continuous => Arc::new(LinearGaussianImputer),
        VariableKind::Continuous => Arc::new(PredictiveMeanMatchingImputer::default()),
        VariableKind::Ordinal => Arc::new(OrdinalRegressionImputer::new(spec)),
        VariableKind::Categorical => Arc::new(ClassificationTreeImputer::new(spec)),
        VariableKind::Indicator => return None,
    };
    Some(imputer)
}

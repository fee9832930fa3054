//! Variable definitions and the study variable catalog
//!
//! The catalog lists every variable of a study in dependency order together
//! with its kind, group, and known levels. Stages, storage, and the reader
//! all take their column layout from it.

use serde::{Deserialize, Serialize};

use super::types::{VariableGroup, VariableKind};
use crate::error::{ImputationError, Result};

/// Level of `receives_care` that gates the type/hours step
pub const RECEIVES_CARE_YES: &str = "Yes";

/// Definition of one study variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub group: VariableGroup,
    pub kind: VariableKind,
    /// Known levels; for ordinal variables this is the order
    #[serde(default)]
    pub levels: Vec<String>,
}

impl VariableSpec {
    pub fn new(name: impl Into<String>, group: VariableGroup, kind: VariableKind) -> Self {
        Self {
            name: name.into(),
            group,
            kind,
            levels: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_levels<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.levels = levels.into_iter().map(Into::into).collect();
        self
    }

    /// Position of a level in the declared order
    #[must_use]
    pub fn level_index(&self, level: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == level)
    }

    /// Column holding the allocation string in the transformed input
    #[must_use]
    pub fn allocation_column(&self) -> String {
        format!("{}_allocation", self.name)
    }
}

/// Names of the variables that take part in the childcare sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildcareRoles {
    pub receives_care: String,
    pub care_type: String,
    pub care_hours: String,
    pub indicator: String,
}

impl Default for ChildcareRoles {
    fn default() -> Self {
        Self {
            receives_care: "receives_care".to_string(),
            care_type: "care_type".to_string(),
            care_hours: "care_hours".to_string(),
            indicator: "formal_care".to_string(),
        }
    }
}

/// Ordered set of variables for one study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableCatalog {
    variables: Vec<VariableSpec>,
    childcare: ChildcareRoles,
}

impl VariableCatalog {
    /// Create a new builder for constructing a catalog
    #[must_use]
    pub fn builder() -> VariableCatalogBuilder {
        VariableCatalogBuilder::default()
    }

    /// Default catalog of the child-development study
    #[must_use]
    pub fn child_development() -> Self {
        use VariableGroup::{Childcare, Derived, Deterministic, Geography, Sociodemographic};
        use VariableKind::{Categorical, Continuous, Indicator, Ordinal};

        let variables = vec![
            VariableSpec::new("child_age_months", Deterministic, Continuous),
            VariableSpec::new("child_sex", Deterministic, Categorical)
                .with_levels(["Female", "Male"]),
            VariableSpec::new("county", Geography, Categorical),
            VariableSpec::new("puma", Geography, Categorical),
            VariableSpec::new("cbsa", Geography, Categorical),
            VariableSpec::new("respondent_age", Sociodemographic, Continuous),
            VariableSpec::new("respondent_education", Sociodemographic, Ordinal).with_levels([
                "Less than high school",
                "High school",
                "Some college",
                "Bachelor's",
                "Graduate",
            ]),
            VariableSpec::new("household_income", Sociodemographic, Continuous),
            VariableSpec::new("household_size", Sociodemographic, Ordinal)
                .with_levels(["2", "3", "4", "5", "6+"]),
            VariableSpec::new("employment_status", Sociodemographic, Categorical).with_levels([
                "Full-time",
                "Part-time",
                "Unemployed",
                "Not in labor force",
            ]),
            VariableSpec::new("marital_status", Sociodemographic, Categorical)
                .with_levels(["Married", "Partnered", "Single"]),
            VariableSpec::new("race_ethnicity", Sociodemographic, Categorical).with_levels([
                "Hispanic",
                "White",
                "Black",
                "Asian",
                "Multiracial/Other",
            ]),
            VariableSpec::new("receives_care", Childcare, Categorical).with_levels(["No", "Yes"]),
            VariableSpec::new("care_type", Childcare, Categorical).with_levels([
                "Center",
                "Family child care",
                "Relative",
                "Nanny",
                "Other",
            ]),
            VariableSpec::new("care_hours", Childcare, Continuous),
            VariableSpec::new("formal_care", Derived, Indicator),
        ];

        Self {
            variables,
            childcare: ChildcareRoles::default(),
        }
    }

    /// All variables in dependency order
    #[must_use]
    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&VariableSpec> {
        self.get(name)
            .ok_or_else(|| ImputationError::schema(format!("Unknown variable '{name}'")))
    }

    /// Variables belonging to one group, in catalog order
    pub fn group(&self, group: VariableGroup) -> impl Iterator<Item = &VariableSpec> {
        self.variables.iter().filter(move |v| v.group == group)
    }

    /// Variables that can ever receive imputation rows
    pub fn imputable(&self) -> impl Iterator<Item = &VariableSpec> {
        self.variables
            .iter()
            .filter(|v| v.group != VariableGroup::Deterministic)
    }

    #[must_use]
    pub const fn childcare(&self) -> &ChildcareRoles {
        &self.childcare
    }

    /// Check names are unique and the childcare roles resolve to the right kinds
    pub fn validate(&self) -> Result<()> {
        let mut seen = rustc_hash::FxHashSet::default();
        for variable in &self.variables {
            let reserved = variable.name == "record_id" || variable.name == "included";
            if variable.name.is_empty() || reserved {
                return Err(ImputationError::schema(format!(
                    "Invalid variable name '{}'",
                    variable.name
                )));
            }
            if !seen.insert(variable.name.as_str()) {
                return Err(ImputationError::schema(format!(
                    "Duplicate variable '{}'",
                    variable.name
                )));
            }
            if variable.kind == VariableKind::Ordinal && variable.levels.len() < 2 {
                return Err(ImputationError::schema(format!(
                    "Ordinal variable '{}' needs at least two levels",
                    variable.name
                )));
            }
        }

        let roles = &self.childcare;
        let expect = |name: &str, group: VariableGroup, kind: VariableKind| -> Result<()> {
            let spec = self.require(name)?;
            if spec.group != group || spec.kind != kind {
                return Err(ImputationError::schema(format!(
                    "Variable '{name}' must be a {group} {kind:?} variable"
                )));
            }
            Ok(())
        };
        expect(&roles.receives_care, VariableGroup::Childcare, VariableKind::Categorical)?;
        expect(&roles.care_type, VariableGroup::Childcare, VariableKind::Categorical)?;
        expect(&roles.care_hours, VariableGroup::Childcare, VariableKind::Continuous)?;
        expect(&roles.indicator, VariableGroup::Derived, VariableKind::Indicator)?;

        let receives = self.require(&roles.receives_care)?;
        if receives.level_index(RECEIVES_CARE_YES).is_none() {
            return Err(ImputationError::schema(format!(
                "Variable '{}' must declare the level '{RECEIVES_CARE_YES}'",
                roles.receives_care
            )));
        }

        Ok(())
    }
}

/// Builder for constructing a variable catalog
#[derive(Debug, Clone, Default)]
pub struct VariableCatalogBuilder {
    variables: Vec<VariableSpec>,
    childcare: ChildcareRoles,
}

impl VariableCatalogBuilder {
    /// Append a variable; call order is dependency order
    #[must_use]
    pub fn variable(mut self, spec: VariableSpec) -> Self {
        self.variables.push(spec);
        self
    }

    /// Override the childcare role names
    #[must_use]
    pub fn childcare_roles(mut self, roles: ChildcareRoles) -> Self {
        self.childcare = roles;
        self
    }

    /// Build and validate the catalog
    pub fn build(self) -> Result<VariableCatalog> {
        let catalog = VariableCatalog {
            variables: self.variables,
            childcare: self.childcare,
        };
        catalog.validate()?;
        Ok(catalog)
    }
}

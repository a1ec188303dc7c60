//! Run plans: the TOML file `ratchet start --plan` turns into the initial
//! envelope.
//!
//! ```toml
//! specification = "A calculator library."
//! signatures = ["pub fn add(a: i32, b: i32) -> i32"]
//! fixtures = []
//!
//! [[requirements]]
//! id = "add"
//! text = "add(2, 3) returns 5"
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::core::ids::validate_id;
use crate::core::types::{Requirement, StateEnvelope};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunPlan {
    #[serde(default)]
    pub specification: String,
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub fixtures: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

impl RunPlan {
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for requirement in &self.requirements {
            validate_id(&requirement.id)
                .with_context(|| format!("requirement id {:?}", requirement.id))?;
            if requirement.text.trim().is_empty() {
                bail!("requirement {} has no text", requirement.id);
            }
            if !seen.insert(requirement.id.as_str()) {
                bail!("duplicate requirement id {}", requirement.id);
            }
        }
        Ok(())
    }

    pub fn into_envelope(self) -> StateEnvelope {
        let mut state = StateEnvelope::new(self.specification, self.requirements);
        state.public_signatures = self.signatures;
        state.fixtures = self.fixtures;
        state
    }
}

pub fn load_plan(path: &Path) -> Result<RunPlan> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let plan: RunPlan = toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    plan.validate()
        .with_context(|| format!("invalid plan {}", path.display()))?;
    Ok(plan)
}

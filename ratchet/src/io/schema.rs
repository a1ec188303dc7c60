//! JSON Schemas constraining agent output, embedded at build time.

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

pub const TEST_CASE_SCHEMA: &str = include_str!("../../schemas/test_case.schema.json");
pub const VERDICT_SCHEMA: &str = include_str!("../../schemas/verdict.schema.json");
pub const MODIFICATION_SCHEMA: &str = include_str!("../../schemas/modification.schema.json");

/// Validate a JSON instance against a JSON Schema (Draft 2020-12), listing
/// every violation.
pub fn validate_against(instance: &Value, schema_raw: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_raw).context("parse json schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled.iter_errors(instance).map(|err| err.to_string()).collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

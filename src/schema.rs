//! JSON Schema 2020-12 contracts validated at runtime: job payloads at flow
//! submission and pipeline ingress, and pending-memory metadata before a
//! storage retry.

pub(crate) mod jobs;
pub(crate) mod memory;

use serde_json::Value;

/// Schema validation outcome.
#[derive(Debug)]
pub(crate) struct ValidationResult {
    pub(crate) valid: bool,
    pub(crate) errors: Vec<String>,
}

impl ValidationResult {
    pub(crate) fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub(crate) fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// Validate an instance against a schema document.
pub(crate) fn validate_json(schema_json: &Value, instance: &Value) -> ValidationResult {
    match jsonschema::validator_for(schema_json) {
        Ok(schema) => {
            let errors: Vec<String> = schema
                .iter_errors(instance)
                .map(|error| format!("{}: {}", error.instance_path, error))
                .collect();
            if errors.is_empty() {
                ValidationResult::valid()
            } else {
                ValidationResult::invalid(errors)
            }
        }
        Err(e) => ValidationResult::invalid(vec![format!("schema compilation error: {e}")]),
    }
}

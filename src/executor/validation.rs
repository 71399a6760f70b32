//! 输出校验：JSON Schema（jsonschema crate）

use serde_json::Value;

use crate::executor::traits::{ValidationEngine, ValidationOutcome};

#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl ValidationEngine for SchemaValidator {
    fn validate(&self, raw: &Value, schema: &Value) -> ValidationOutcome {
        let validator = match jsonschema::validator_for(schema) {
            Ok(validator) => validator,
            Err(e) => {
                tracing::warn!(error = %e, "output schema does not compile");
                return ValidationOutcome::invalid(vec![format!("invalid output schema: {e}")]);
            }
        };
        let errors: Vec<String> = validator.iter_errors(raw).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            ValidationOutcome::ok(raw.clone())
        } else {
            ValidationOutcome::invalid(errors)
        }
    }
}

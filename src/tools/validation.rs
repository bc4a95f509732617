//! Field-level parameter validation against a tool's JSON Schema.

use jsonschema::{error::ValidationErrorKind, JSONSchema, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name used when the error applies to the whole argument object.
pub const ROOT_FIELD: &str = "$";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ValidationResult = Result<(), Vec<FieldError>>;

/// Checks `parameters` against `schema`, collecting every violation.
///
/// Fields are dotted instance paths (`opts.depth`, `tags.0`). A schema that does
/// not compile is reported as a single error on [`ROOT_FIELD`].
pub fn validate_against_schema(schema: &Value, parameters: &Map<String, Value>) -> ValidationResult {
    let compiled = JSONSchema::compile(schema).map_err(|err| {
        vec![FieldError::new(
            ROOT_FIELD,
            format!("tool schema is invalid: {err}"),
        )]
    })?;

    let instance = Value::Object(parameters.clone());
    let result = compiled.validate(&instance);
    let errors = match result {
        Ok(()) => return Ok(()),
        Err(errors) => errors.flat_map(field_errors).collect::<Vec<_>>(),
    };

    Err(errors)
}

fn field_errors(error: ValidationError<'_>) -> Vec<FieldError> {
    let path = dotted_path(&error.instance_path.to_string());
    let message = error.to_string();

    match &error.kind {
        ValidationErrorKind::Required { property } => {
            let name = property
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| property.to_string());
            vec![FieldError::new(join(&path, &name), "field is required")]
        }
        ValidationErrorKind::AdditionalProperties { unexpected } => unexpected
            .iter()
            .map(|name| FieldError::new(join(&path, name), "unexpected field"))
            .collect(),
        _ => vec![FieldError::new(
            if path.is_empty() { ROOT_FIELD.to_string() } else { path },
            message,
        )],
    }
}

// JSON pointer "/opts/depth" -> "opts.depth"
fn dotted_path(pointer: &str) -> String {
    pointer
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect::<Vec<_>>()
        .join(".")
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

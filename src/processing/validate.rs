//! Payload validators.
//!
//! Validators never raise; they hand back a tagged result that the processor
//! turns into a skipped cycle.

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fmt;

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// JSON pointer-ish path of the offending value ("" for the root).
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

pub trait PayloadValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), ValidationError>;
}

impl<F> PayloadValidator for F
where
    F: Fn(&Value) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        self(payload)
    }
}

/// JSON kind a required field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Any,
    Object,
    Array,
    String,
    Number,
    Bool,
}

impl FieldKind {
    fn matches(&self, v: &Value) -> bool {
        match self {
            FieldKind::Any => true,
            FieldKind::Object => v.is_object(),
            FieldKind::Array => v.is_array(),
            FieldKind::String => v.is_string(),
            FieldKind::Number => v.is_number(),
            FieldKind::Bool => v.is_boolean(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::Any => "any",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "boolean",
        }
    }
}

/// Narrow structural check: the payload is an object and carries the listed
/// top-level fields with the listed kinds. Nothing else is inspected.
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    required: Vec<(String, FieldKind)>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.required.push((field.into(), kind));
        self
    }
}

impl PayloadValidator for SchemaValidator {
    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        let obj = payload
            .as_object()
            .ok_or_else(|| ValidationError::new("", "payload must be an object"))?;
        for (field, kind) in &self.required {
            match obj.get(field) {
                None => {
                    return Err(ValidationError::new(
                        format!("/{}", field),
                        "required field missing",
                    ))
                }
                Some(v) if !kind.matches(v) => {
                    return Err(ValidationError::new(
                        format!("/{}", field),
                        format!("expected {}", kind.name()),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Validates against a compiled Draft 7 JSON Schema.
pub struct JsonSchemaValidator {
    schema: JSONSchema,
}

impl JsonSchemaValidator {
    pub fn new(schema: &Value) -> crate::Result<Self> {
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| {
                crate::Error::configuration_with_context(
                    format!("failed to compile schema: {}", e),
                    crate::ErrorContext::new().with_source("json_schema_validator"),
                )
            })?;
        Ok(Self { schema })
    }
}

impl PayloadValidator for JsonSchemaValidator {
    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        match self.schema.validate(payload) {
            Ok(()) => Ok(()),
            Err(mut errors) => {
                // first error is enough for a skip reason
                let first = errors
                    .next()
                    .map(|e| ValidationError::new(e.instance_path.to_string(), e.to_string()))
                    .unwrap_or_else(|| ValidationError::new("", "schema validation failed"));
                Err(first)
            }
        }
    }
}

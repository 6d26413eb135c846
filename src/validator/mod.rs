//! Testing descriptor validation.
//!
//! Structural validation (schema) runs first and batches every violation.
//! Only a structurally valid tree is converted into a [`TestDescriptor`];
//! semantic validation then runs over the typed model.

pub mod metrics;
pub mod schema;
pub mod semantic;

pub use metrics::validate_metrics_collection_process;
pub use schema::{validate_structure, StructuralError, StructuralErrorKind};
pub use semantic::{validate_tests_parameters, SemanticError};

use serde_json::Value;

use crate::descriptor::TestDescriptor;

/// Validate the structure of `value` and convert it into the typed model.
pub fn parse_descriptor(value: &Value) -> Result<TestDescriptor, Vec<StructuralError>> {
    let errors = validate_structure(value);
    if !errors.is_empty() {
        return Err(errors);
    }
    serde_json::from_value(value.clone())
        .map_err(|e| vec![StructuralError::malformed(e.to_string())])
}

/// Parse descriptor text (YAML, which includes JSON) and validate it.
pub fn parse_descriptor_yaml(text: &str) -> Result<TestDescriptor, Vec<StructuralError>> {
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| vec![StructuralError::malformed(e.to_string())])?;
    parse_descriptor(&value)
}

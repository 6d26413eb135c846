//! Structural validation of testing descriptors.
//!
//! The descriptor schema is a tree of [`Rule`]s. Validation walks the
//! document and the schema side by side and collects every violation instead
//! of stopping at the first one, so a developer sees everything that is wrong
//! with a descriptor in a single round trip.

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::descriptor::{testcase_name_regex, TestCaseKind};

/// Primitive type expected at a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Dict,
    List,
    /// Any non-null value (parameter values).
    Any,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Dict => value.is_object(),
            FieldType::List => value.is_array(),
            FieldType::Any => true,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Dict => "dict",
            FieldType::List => "list",
            FieldType::Any => "any",
        };
        f.write_str(name)
    }
}

/// What a nested node contains.
#[derive(Debug, Clone)]
pub enum Nested {
    None,
    /// Named fields of a dict, in declaration order.
    Fields(Vec<(&'static str, Rule)>),
    /// Rule applied to every element of a list.
    Items(Box<Rule>),
}

/// One node of the schema tree.
#[derive(Debug, Clone)]
pub struct Rule {
    pub field_type: FieldType,
    pub required: bool,
    /// Permitted string values. Empty means unconstrained.
    pub allowed: &'static [&'static str],
    /// Pattern every string value must match.
    pub pattern: Option<&'static Regex>,
    pub nested: Nested,
}

impl Rule {
    fn leaf(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            allowed: &[],
            pattern: None,
            nested: Nested::None,
        }
    }

    pub fn string() -> Self {
        Self::leaf(FieldType::String)
    }

    pub fn integer() -> Self {
        Self::leaf(FieldType::Integer)
    }

    pub fn any() -> Self {
        Self::leaf(FieldType::Any)
    }

    pub fn dict(fields: Vec<(&'static str, Rule)>) -> Self {
        Self {
            nested: Nested::Fields(fields),
            ..Self::leaf(FieldType::Dict)
        }
    }

    pub fn list_of(item: Rule) -> Self {
        Self {
            nested: Nested::Items(Box::new(item)),
            ..Self::leaf(FieldType::List)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn allowed(mut self, values: &'static [&'static str]) -> Self {
        self.allowed = values;
        self
    }

    pub fn matching(mut self, pattern: &'static Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }
}

/// What went wrong at a path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralErrorKind {
    #[error("required field")]
    Missing,
    #[error("must be of {0} type")]
    WrongType(FieldType),
    #[error("null value not allowed")]
    Null,
    #[error("unallowed value '{value}', expected one of: {}", .allowed.join(", "))]
    NotAllowed { value: String, allowed: Vec<String> },
    #[error("value '{value}' does not match {pattern}")]
    Mismatch { value: String, pattern: String },
    #[error("unknown field")]
    Unknown,
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// A structural violation at a dotted path such as
/// `test_phases.setup.testcases[0].testcase_id`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {kind}")]
pub struct StructuralError {
    pub path: String,
    pub kind: StructuralErrorKind,
}

impl StructuralError {
    fn new(path: &str, kind: StructuralErrorKind) -> Self {
        Self {
            path: if path.is_empty() { "<root>".to_string() } else { path.to_string() },
            kind,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::new("", StructuralErrorKind::Malformed(message.into()))
    }
}

fn key_value_list() -> Rule {
    Rule::list_of(Rule::dict(vec![
        ("key", Rule::string().required()),
        ("value", Rule::any().required()),
    ]))
}

/// The fixed descriptor schema.
pub fn descriptor_schema() -> Rule {
    let test_info = Rule::dict(vec![
        ("netapp_id", Rule::string().required()),
        ("network_service_id", Rule::string().required()),
        ("testbed_id", Rule::string().required()),
        ("description", Rule::string()),
    ])
    .required();

    let deployments = Rule::list_of(Rule::dict(vec![
        ("deployment_id", Rule::integer().required()),
        ("name", Rule::string().required()),
        ("descriptor", Rule::string().required()),
        ("id", Rule::string().required()),
        ("parameters", key_value_list()),
    ]))
    .required();

    let testcases = Rule::list_of(Rule::dict(vec![
        ("testcase_id", Rule::integer().required()),
        ("name", Rule::string().required().matching(testcase_name_regex())),
        ("description", Rule::string()),
        (
            "type",
            Rule::string().required().allowed(TestCaseKind::ALLOWED),
        ),
        ("scope", Rule::string().required()),
        ("parameters", key_value_list()),
    ]))
    .required();

    let setup_metrics = Rule::list_of(Rule::dict(vec![
        ("metrics_collection_id", Rule::integer().required()),
        ("description", Rule::string()),
        ("parameters", key_value_list().required()),
    ]));

    let execution = Rule::list_of(Rule::dict(vec![
        ("batch_id", Rule::integer().required()),
        ("scope", Rule::string().required()),
        (
            "executions",
            Rule::list_of(Rule::dict(vec![
                ("execution_id", Rule::integer().required()),
                ("name", Rule::string()),
                ("testcase_ids", Rule::list_of(Rule::integer()).required()),
            ]))
            .required(),
        ),
    ]))
    .required();

    let test_phases = Rule::dict(vec![
        (
            "setup",
            Rule::dict(vec![
                ("deployments", deployments),
                ("testcases", testcases),
                ("metrics_collection", setup_metrics),
            ])
            .required(),
        ),
        ("execution", execution),
    ])
    .required();

    // Dashboard and log provisioning blocks, consumed outside this crate.
    let metrics_jobs = Rule::list_of(Rule::dict(vec![
        ("job_name", Rule::string().required()),
        (
            "metrics_collection",
            Rule::list_of(Rule::dict(vec![
                ("type", Rule::string().required()),
                ("collection_endpoint", Rule::string().required()),
            ]))
            .required(),
        ),
        (
            "viewer",
            Rule::dict(vec![
                ("type", Rule::string().required()),
                ("dashboard_src", Rule::string()),
                ("name_for_dashboard", Rule::string()),
            ]),
        ),
    ]));

    let log_collection = Rule::list_of(Rule::dict(vec![
        ("test_agent_name", Rule::string().required()),
        ("type", Rule::string().required()),
        ("viewer", Rule::string()),
    ]));

    Rule::dict(vec![
        ("test_info", test_info),
        ("test_phases", test_phases),
        ("metrics_collection", metrics_jobs),
        ("log_collection", log_collection),
    ])
    .required()
}

/// Validate `descriptor` against the descriptor schema.
///
/// Returns every violation found; an empty vector means the document is
/// structurally valid.
pub fn validate_structure(descriptor: &Value) -> Vec<StructuralError> {
    validate_against(&descriptor_schema(), descriptor)
}

/// Validate `value` against an arbitrary schema rule.
pub fn validate_against(rule: &Rule, value: &Value) -> Vec<StructuralError> {
    let mut errors = Vec::new();
    check(rule, value, "", &mut errors);
    errors
}

fn check(rule: &Rule, value: &Value, path: &str, errors: &mut Vec<StructuralError>) {
    if value.is_null() {
        errors.push(StructuralError::new(path, StructuralErrorKind::Null));
        return;
    }
    if !rule.field_type.matches(value) {
        errors.push(StructuralError::new(
            path,
            StructuralErrorKind::WrongType(rule.field_type),
        ));
        return;
    }
    if !rule.allowed.is_empty() {
        if let Some(s) = value.as_str() {
            if !rule.allowed.contains(&s) {
                errors.push(StructuralError::new(
                    path,
                    StructuralErrorKind::NotAllowed {
                        value: s.to_string(),
                        allowed: rule.allowed.iter().map(|a| a.to_string()).collect(),
                    },
                ));
            }
        }
    }
    if let (Some(pattern), Some(s)) = (rule.pattern, value.as_str()) {
        if !pattern.is_match(s) {
            errors.push(StructuralError::new(
                path,
                StructuralErrorKind::Mismatch {
                    value: s.to_string(),
                    pattern: pattern.as_str().to_string(),
                },
            ));
        }
    }

    match (&rule.nested, value) {
        (Nested::Fields(fields), Value::Object(map)) => {
            for (name, field_rule) in fields {
                let field_path = join(path, name);
                match map.get(*name) {
                    Some(v) => check(field_rule, v, &field_path, errors),
                    None if field_rule.required => {
                        errors.push(StructuralError::new(&field_path, StructuralErrorKind::Missing))
                    }
                    None => {}
                }
            }
            for key in map.keys() {
                if !fields.iter().any(|(name, _)| name == key) {
                    errors.push(StructuralError::new(
                        &join(path, key),
                        StructuralErrorKind::Unknown,
                    ));
                }
            }
        }
        (Nested::Items(item_rule), Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                check(item_rule, item, &format!("{path}[{i}]"), errors);
            }
        }
        _ => {}
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

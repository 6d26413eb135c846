//! Typed testing descriptor model.
//!
//! Descriptors arrive as an untyped YAML/JSON tree. Once
//! [`crate::validator::schema::validate_structure`] accepts the tree it is
//! converted into these structs, so the semantic validator and the renderer
//! never touch untyped maps.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Testcase names are spliced into agent shell commands and archive paths.
pub const TESTCASE_NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]*$";

pub(crate) fn testcase_name_regex() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(TESTCASE_NAME_PATTERN).expect("testcase name pattern is valid"))
}

pub fn is_valid_testcase_name(name: &str) -> bool {
    testcase_name_regex().is_match(name)
}

/// A full testing descriptor as submitted by a NetApp developer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDescriptor {
    pub test_info: TestInfo,
    pub test_phases: TestPhases,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestInfo {
    pub testbed_id: String,
    pub netapp_id: String,
    pub network_service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPhases {
    pub setup: Setup,
    pub execution: Vec<ExecutionBatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    pub deployments: Vec<Deployment>,
    pub testcases: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_collection: Option<Vec<MetricsCollection>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: i64,
    pub name: String,
    pub descriptor: String,
    pub id: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// Whether a testcase comes from the testbed catalogue or from the developer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestCaseKind {
    #[serde(rename = "predefined")]
    Predefined,
    #[serde(rename = "developer-defined")]
    DeveloperDefined,
}

impl TestCaseKind {
    pub const ALLOWED: &'static [&'static str] = &["predefined", "developer-defined"];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestCaseKind::Predefined => "predefined",
            TestCaseKind::DeveloperDefined => "developer-defined",
        }
    }
}

impl std::fmt::Display for TestCaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub testcase_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TestCaseKind,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl TestCase {
    /// Look up the value supplied for `key`, if any.
    pub fn parameter(&self, key: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.key == key)
    }
}

/// A `{key, value}` pair. Values may be any YAML scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: serde_json::Value,
}

impl Parameter {
    /// The value as the text a shell or an option list would see.
    ///
    /// Strings are returned verbatim; other scalars use their JSON rendering
    /// (`42`, `true`, `1.5`).
    pub fn value_string(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsCollection {
    pub metrics_collection_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBatch {
    pub batch_id: i64,
    pub scope: String,
    pub executions: Vec<Execution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub testcase_ids: Vec<i64>,
}

impl TestDescriptor {
    /// Testcase ids referenced by any execution batch, in reference order.
    pub fn referenced_testcase_ids(&self) -> Vec<i64> {
        self.test_phases
            .execution
            .iter()
            .flat_map(|batch| batch.executions.iter())
            .flat_map(|execution| execution.testcase_ids.iter().copied())
            .collect()
    }

    /// Declared testcases that at least one execution references, in
    /// declaration order.
    pub fn executed_testcases(&self) -> Vec<&TestCase> {
        let referenced = self.referenced_testcase_ids();
        self.test_phases
            .setup
            .testcases
            .iter()
            .filter(|tc| referenced.contains(&tc.testcase_id))
            .collect()
    }

    /// Declared metrics-collection blocks, empty when the section is absent.
    pub fn metrics_collection(&self) -> &[MetricsCollection] {
        self.test_phases
            .setup
            .metrics_collection
            .as_deref()
            .unwrap_or(&[])
    }
}

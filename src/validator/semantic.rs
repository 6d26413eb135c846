//! Semantic validation of executed tests against a testbed catalogue.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogueEntry;
use crate::descriptor::{TestCaseKind, TestDescriptor};

/// A descriptor that is well-formed but asks for something the testbed
/// cannot do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SemanticError {
    #[error("{test} doesn't exist in the chosen testbed.")]
    UnknownTest { test: String },

    #[error("The parameter \"{parameter}\" must be defined for the test {test}.")]
    MissingParameter { test: String, parameter: String },

    #[error("The parameter \"{parameter}\", for the test {test}, is not according to its possible_options.")]
    InvalidOption { test: String, parameter: String },

    #[error("Execution {execution_id} of batch {batch_id} references testcase {testcase_id}, which is not declared in the setup.")]
    UndeclaredTestcase {
        batch_id: i64,
        execution_id: i64,
        testcase_id: i64,
    },

    #[error("Testcase {testcase_id} is declared more than once in the setup.")]
    DuplicateTestcase { testcase_id: i64 },
}

/// Check every executed testcase of `descriptor` against `catalogue`.
///
/// `catalogue` holds the entries of the descriptor's testbed. Predefined
/// tests are matched by name; developer-defined tests carry their own code
/// and skip catalogue matching. All errors are returned together.
pub fn validate_tests_parameters(
    descriptor: &TestDescriptor,
    catalogue: &[CatalogueEntry],
) -> Vec<SemanticError> {
    let mut errors = duplicate_testcases(descriptor);
    errors.extend(undeclared_testcases(descriptor));

    for testcase in descriptor.executed_testcases() {
        if testcase.kind == TestCaseKind::DeveloperDefined {
            continue;
        }

        let Some(entry) = catalogue.iter().find(|e| e.name == testcase.name) else {
            errors.push(SemanticError::UnknownTest {
                test: testcase.name.clone(),
            });
            continue;
        };

        for variable in &entry.variables {
            match testcase.parameter(&variable.name) {
                Some(param) => {
                    if !variable.accepts(&param.value_string()) {
                        errors.push(SemanticError::InvalidOption {
                            test: testcase.name.clone(),
                            parameter: variable.name.clone(),
                        });
                    }
                }
                None if variable.mandatory => errors.push(SemanticError::MissingParameter {
                    test: testcase.name.clone(),
                    parameter: variable.name.clone(),
                }),
                None => {}
            }
        }
    }

    errors
}

/// Each testcase id names one run test, so it may be declared only once.
fn duplicate_testcases(descriptor: &TestDescriptor) -> Vec<SemanticError> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    descriptor
        .test_phases
        .setup
        .testcases
        .iter()
        .map(|tc| tc.testcase_id)
        .filter(|id| !seen.insert(*id) && reported.insert(*id))
        .map(|testcase_id| SemanticError::DuplicateTestcase { testcase_id })
        .collect()
}

fn undeclared_testcases(descriptor: &TestDescriptor) -> Vec<SemanticError> {
    let declared: HashSet<i64> = descriptor
        .test_phases
        .setup
        .testcases
        .iter()
        .map(|tc| tc.testcase_id)
        .collect();

    let mut errors = Vec::new();
    for batch in &descriptor.test_phases.execution {
        for execution in &batch.executions {
            for id in &execution.testcase_ids {
                if !declared.contains(id) {
                    errors.push(SemanticError::UndeclaredTestcase {
                        batch_id: batch.batch_id,
                        execution_id: execution.execution_id,
                        testcase_id: *id,
                    });
                }
            }
        }
    }
    errors
}

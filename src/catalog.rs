//! Testbed catalogue model and the YAML files it is seeded from.
//!
//! A testbed registers the predefined tests it can run together with the
//! parameter contract of each test. The metrics-collection bundle has a
//! contract of the same shape.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::CatalogueStore;

/// A named target environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Testbed {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A testbed-registered executable test and its parameter contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogueEntry {
    pub testbed_id: String,
    /// Catalogue key of the test within its testbed.
    pub test_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub ftp_base_location: String,
    pub test_filename: String,
    #[serde(default)]
    pub test_type: String,
    #[serde(default)]
    pub variables: Vec<TestVariable>,
}

/// One parameter a catalogue test (or the metrics bundle) understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVariable {
    #[serde(rename = "variable_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Allowed values. Empty means unconstrained.
    #[serde(default)]
    pub possible_options: Vec<VariableOption>,
}

fn default_mandatory() -> bool {
    true
}

impl TestVariable {
    /// True when `value` is acceptable for this variable.
    pub fn accepts(&self, value: &str) -> bool {
        self.possible_options.is_empty() || self.possible_options.iter().any(|o| o.name == value)
    }
}

/// An allowed value of a [`TestVariable`].
///
/// Catalogue files list options either as bare strings or as `{name: ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawOption")]
pub struct VariableOption {
    pub name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOption {
    Bare(String),
    Named { name: String },
}

impl From<RawOption> for VariableOption {
    fn from(raw: RawOption) -> Self {
        match raw {
            RawOption::Bare(name) | RawOption::Named { name } => VariableOption { name },
        }
    }
}

impl From<&str> for VariableOption {
    fn from(name: &str) -> Self {
        VariableOption { name: name.to_string() }
    }
}

/// Contract of the metrics-collection bundle shipped to every agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsContract {
    pub ftp_base_location: String,
    pub test_filename: String,
    #[serde(default)]
    pub variables: Vec<TestVariable>,
}

impl MetricsContract {
    /// Load `metrics_collection: {...}` from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        #[derive(Deserialize)]
        struct File {
            metrics_collection: MetricsContract,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read metrics contract: {}", path.display()))?;
        let file: File = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse metrics contract: {}", path.display()))?;
        Ok(file.metrics_collection)
    }

    pub fn mandatory_names(&self) -> impl Iterator<Item = &str> {
        self.variables
            .iter()
            .filter(|v| v.mandatory)
            .map(|v| v.name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Seed files
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TestsFile {
    tests: BTreeMap<String, BTreeMap<String, TestsFileEntry>>,
}

#[derive(Debug, Deserialize)]
struct TestsFileEntry {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    ftp_base_location: String,
    test_filename: String,
    #[serde(default)]
    test_type: String,
    #[serde(default)]
    test_variables: Vec<TestVariable>,
}

/// Parse a tests catalogue file (`tests: {testbed: {key: entry}}`).
pub fn parse_tests_yaml(content: &str) -> Result<Vec<CatalogueEntry>> {
    let file: TestsFile = serde_yaml::from_str(content).context("malformed tests catalogue")?;
    let entries = file
        .tests
        .into_iter()
        .flat_map(|(testbed_id, tests)| {
            tests.into_values().map(move |t| CatalogueEntry {
                testbed_id: testbed_id.clone(),
                test_id: t.id,
                name: t.name,
                description: t.description,
                ftp_base_location: t.ftp_base_location,
                test_filename: t.test_filename,
                test_type: t.test_type,
                variables: t.test_variables,
            })
        })
        .collect();
    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct TestbedsFile {
    testbeds: BTreeMap<String, TestbedsFileEntry>,
}

#[derive(Debug, Deserialize)]
struct TestbedsFileEntry {
    name: String,
    #[serde(default)]
    description: String,
}

/// Parse a testbeds file (`testbeds: {id: {name, description}}`).
pub fn parse_testbeds_yaml(content: &str) -> Result<Vec<Testbed>> {
    let file: TestbedsFile = serde_yaml::from_str(content).context("malformed testbeds file")?;
    Ok(file
        .testbeds
        .into_iter()
        .map(|(id, t)| Testbed {
            id,
            name: t.name,
            description: t.description,
        })
        .collect())
}

/// Load the testbeds file, then the tests file, into `store`.
///
/// Every test must belong to a testbed already known to the store. Returns
/// the number of testbeds and tests imported.
pub fn import_catalogue(
    store: &dyn CatalogueStore,
    testbeds_path: &Path,
    tests_path: &Path,
) -> Result<(usize, usize)> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    };

    let testbeds = parse_testbeds_yaml(&read(testbeds_path)?)?;
    for testbed in &testbeds {
        store.upsert_testbed(testbed)?;
    }

    let tests = parse_tests_yaml(&read(tests_path)?)?;
    for entry in &tests {
        if store.get_testbed(&entry.testbed_id)?.is_none() {
            bail!("test {} references unknown testbed {}", entry.test_id, entry.testbed_id);
        }
        store.upsert_test(entry)?;
    }

    tracing::info!(testbeds = testbeds.len(), tests = tests.len(), "imported catalogue");
    Ok((testbeds.len(), tests.len()))
}

//! Pipeline script rendering.
//!
//! A validated descriptor plus catalogue metadata is compiled into a Jenkins
//! declarative pipeline by filling the block slots of a [`PipelineTemplate`]
//! and resolving the value placeholders of its text. Rendering is pure: the same
//! inputs always produce the same bytes, and a script is either complete or
//! not produced at all.

pub mod commands;
pub mod template;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::catalog::{CatalogueEntry, MetricsContract};
use crate::config::ManagerConfig;
use crate::descriptor::{is_valid_testcase_name, MetricsCollection, TestCase, TestCaseKind, TestDescriptor};

pub use template::{FillError, PipelineTemplate, Slot, TemplateError};

use commands::{sh, MetricsAction, MetricsCollectionCommands};

/// Agent credential holding the communication token of run
/// `test_instance_id`. Every run gets its own so concurrent runs on one
/// agent keep their tokens.
pub fn communication_token_credential(test_instance_id: i64) -> String {
    format!("communication_token_{test_instance_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("no commands for block {0}")]
    UnfilledSlot(Slot),

    #[error("placeholder <{0}> survived rendering")]
    UnresolvedPlaceholder(String),

    #[error("test {test} is not registered for testbed {testbed}")]
    UnknownTest { test: String, testbed: String },

    #[error("test name {0:?} is not usable in a pipeline")]
    InvalidTestName(String),

    #[error("invalid template: {0}")]
    Template(#[from] TemplateError),
}

impl From<FillError> for RenderError {
    fn from(err: FillError) -> Self {
        match err {
            FillError::EmptySlot(slot) => RenderError::UnfilledSlot(slot),
            FillError::MissingValue(name) => RenderError::UnresolvedPlaceholder(name),
        }
    }
}

/// A testcase selected for execution, with its unique run-scoped name.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedTest {
    pub testcase: TestCase,
    pub full_name: String,
}

impl ExecutedTest {
    pub fn new(testcase: TestCase) -> Self {
        let full_name = match testcase.kind {
            TestCaseKind::Predefined => {
                format!("{}-test-id-{}", testcase.name, testcase.testcase_id)
            }
            TestCaseKind::DeveloperDefined => {
                format!("dev-defined-{}-test-id-{}", testcase.name, testcase.testcase_id)
            }
        };
        Self { testcase, full_name }
    }

    /// Executed testcases of `descriptor`, in declaration order.
    pub fn from_descriptor(descriptor: &TestDescriptor) -> Vec<Self> {
        descriptor
            .executed_testcases()
            .into_iter()
            .cloned()
            .map(Self::new)
            .collect()
    }

    pub fn is_developer_defined(&self) -> bool {
        self.testcase.kind == TestCaseKind::DeveloperDefined
    }
}

/// Deployment-specific values baked into every script.
#[derive(Debug, Clone)]
pub struct RendererSettings {
    /// Manager base URL without a trailing slash.
    pub manager_url: String,
    pub metrics_location: String,
    pub metrics_database: String,
    pub robot_version: String,
    pub test_python_modules: Vec<String>,
    pub metrics_python_modules: Vec<String>,
}

impl RendererSettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            manager_url: config.manager.url.trim_end_matches('/').to_string(),
            metrics_location: config.metrics_repository.location.clone(),
            metrics_database: config.metrics_repository.database.clone(),
            robot_version: config.pipeline.robot_version.clone(),
            test_python_modules: config.pipeline.test_python_modules.clone(),
            metrics_python_modules: config.pipeline.metrics_python_modules.clone(),
        }
    }

    pub fn test_status_url(&self) -> String {
        format!("{}/tests/test-status", self.manager_url)
    }

    pub fn publish_results_url(&self) -> String {
        format!("{}/tests/publish-test-results", self.manager_url)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRenderer {
    template: PipelineTemplate,
    settings: RendererSettings,
}

impl PipelineRenderer {
    pub fn new(template: PipelineTemplate, settings: RendererSettings) -> Self {
        Self { template, settings }
    }

    /// Build a renderer from configuration, loading a custom template when
    /// one is configured.
    pub fn from_config(config: &ManagerConfig) -> anyhow::Result<Self> {
        let template = match &config.pipeline.template_path {
            Some(path) => PipelineTemplate::load(path)?,
            None => PipelineTemplate::builtin()?,
        };
        Ok(Self::new(template, RendererSettings::from_config(config)))
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    /// Render the pipeline script for one run.
    ///
    /// `catalogue` may hold entries of several testbeds; only those of
    /// `testbed_id` are considered.
    pub fn render(
        &self,
        executed: &[ExecutedTest],
        catalogue: &[CatalogueEntry],
        metrics: &[MetricsCollection],
        contract: &MetricsContract,
        test_instance_id: i64,
        testbed_id: &str,
    ) -> Result<String, RenderError> {
        let (obtain_tests, perform_tests) =
            self.test_blocks(executed, catalogue, test_instance_id, testbed_id)?;

        let metrics_commands = MetricsCollectionCommands::new(&self.settings, metrics, contract);

        let mut blocks: BTreeMap<Slot, Vec<String>> = BTreeMap::new();
        blocks.insert(Slot::SetupEnvironment, commands::setup_environment());
        blocks.insert(Slot::ObtainMetricsEnvironment, commands::testbed_credentials());
        blocks.insert(
            Slot::ObtainMetricsCollectionFiles,
            commands::obtain_metrics_collection_files(contract),
        );
        blocks.insert(
            Slot::StartMetricsCollection,
            metrics_commands.for_action(MetricsAction::Start),
        );
        blocks.insert(Slot::ObtainTestsEnvironment, commands::testbed_credentials());
        blocks.insert(Slot::ObtainTests, obtain_tests);
        blocks.insert(Slot::PerformTests, perform_tests);
        blocks.insert(
            Slot::EndMetricsCollection,
            metrics_commands.for_action(MetricsAction::Stop),
        );
        blocks.insert(
            Slot::PublishResultsEnvironment,
            commands::publish_results_environment(),
        );
        blocks.insert(Slot::PublishResults, commands::publish_results());
        blocks.insert(Slot::CleanupEnvironment, commands::cleanup_environment());

        let values: BTreeMap<&str, String> = BTreeMap::from([
            ("test_id", test_instance_id.to_string()),
            (
                "communication_token_credential",
                communication_token_credential(test_instance_id),
            ),
            ("ci_cd_manager_url_test_status_url", self.settings.test_status_url()),
            (
                "ci_cd_manager_url_publish_test_results",
                self.settings.publish_results_url(),
            ),
        ]);
        let script = self.template.fill(&blocks, &values)?;

        tracing::debug!(
            test_instance_id,
            %testbed_id,
            tests = executed.len(),
            metrics_blocks = metrics.len(),
            bytes = script.len(),
            "rendered pipeline script"
        );
        Ok(script)
    }

    fn test_blocks(
        &self,
        executed: &[ExecutedTest],
        catalogue: &[CatalogueEntry],
        test_instance_id: i64,
        testbed_id: &str,
    ) -> Result<(Vec<String>, Vec<String>), RenderError> {
        let mut obtain = vec![sh(&format!("mkdir -p {}", commands::DEVELOPER_DEFINED_DIR))];
        let mut perform = vec![commands::install_test_modules(&self.settings)];

        for test in executed {
            let tc = &test.testcase;
            if !is_valid_testcase_name(&tc.name) {
                return Err(RenderError::InvalidTestName(tc.name.clone()));
            }
            let (work_dir, target) = match tc.kind {
                TestCaseKind::DeveloperDefined => {
                    obtain.extend(commands::download_developer_defined(
                        &self.settings.manager_url,
                        test_instance_id,
                        &tc.name,
                        &test.full_name,
                    ));
                    let dir = format!("{}/{}", commands::DEVELOPER_DEFINED_DIR, test.full_name);
                    (dir.clone(), dir)
                }
                TestCaseKind::Predefined => {
                    let entry = catalogue
                        .iter()
                        .find(|e| e.testbed_id == testbed_id && e.name == tc.name)
                        .ok_or_else(|| RenderError::UnknownTest {
                            test: tc.name.clone(),
                            testbed: testbed_id.to_string(),
                        })?;
                    let fetch = commands::fetch_from_testbed(&entry.ftp_base_location);
                    if !obtain.contains(&fetch) {
                        obtain.push(fetch);
                    }
                    commands::test_location(
                        commands::REPOSITORY_DIR,
                        &entry.ftp_base_location,
                        &entry.test_filename,
                    )
                }
            };
            perform.push(commands::run_test(
                &self.settings,
                &tc.name,
                &tc.parameters,
                &work_dir,
                &target,
                &test.full_name,
            ));
        }
        Ok((obtain, perform))
    }
}

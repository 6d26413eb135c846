//! Orchestration driver: descriptor in, running pipeline out.
//!
//! Every step of a submission is recorded in the run's status log. A step
//! that fails is logged with `success = false` before its error is
//! returned, so the log always shows where a run stopped.

pub mod results;
pub mod selection;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::agents::{jenkins::JenkinsFleet, AgentDirectory, ControlPlane};
use crate::catalog::{CatalogueEntry, MetricsContract};
use crate::config::ManagerConfig;
use crate::descriptor::{is_valid_testcase_name, TestDescriptor};
use crate::pipeline::{communication_token_credential, ExecutedTest, PipelineRenderer, RenderError};
use crate::storage::{CatalogueStore, NewRun, NewRunTest, RunStore, RunTest, SqliteStore, StatusStore, TestRun};
use crate::transfer::{developer_defined_artifact_path, FileTransfer, LocalWarehouse};
use crate::validator::{
    parse_descriptor, parse_descriptor_yaml, validate_metrics_collection_process,
    validate_tests_parameters, SemanticError, StructuralError,
};

use self::status::{StatusEntry, StatusError, TestState};

const COMMUNICATION_TOKEN_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("descriptor is malformed ({} errors)", .0.len())]
    Structural(Vec<StructuralError>),

    #[error("descriptor does not match the testbed ({} errors)", .0.len())]
    Semantic(Vec<SemanticError>),

    #[error("metrics collection parameters do not satisfy the metrics contract")]
    MetricsContract,

    #[error("testbed {0} does not exist")]
    TestbedNotFound(String),

    #[error("test name {0:?} may only contain letters, digits, '_', '.' and '-'")]
    InvalidTestName(String),

    #[error("developer-defined test {test} has no uploaded artifact")]
    MissingDeveloperDefinedArtifact { test: String },

    #[error("no CI/CD agent of testbed {testbed} is available")]
    NoAgentAvailable { testbed: String },

    #[error("failed to provision the communication token: {0:#}")]
    CredentialProvisioning(anyhow::Error),

    #[error("failed to render the pipeline script: {0}")]
    Render(#[from] RenderError),

    #[error("failed to submit the pipeline: {0:#}")]
    PipelineSubmission(anyhow::Error),

    #[error("failed to retrieve the build log: {0:#}")]
    LogRetrieval(anyhow::Error),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("invalid token for run {0}")]
    Unauthorized(i64),

    #[error("run {0} does not exist")]
    RunNotFound(i64),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Returned to the submitter of an accepted descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub run_id: i64,
    pub testbed_id: String,
    pub job_name: String,
    pub build_number: u64,
    pub access_token: String,
}

/// Everything known about a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: TestRun,
    pub status: Vec<StatusEntry>,
    pub tests: Vec<RunTest>,
}

/// External collaborators of the driver.
#[derive(Clone)]
pub struct Collaborators {
    pub catalogue: Arc<dyn CatalogueStore>,
    pub status: Arc<dyn StatusStore>,
    pub runs: Arc<dyn RunStore>,
    pub agents: Arc<dyn AgentDirectory>,
    pub control: Arc<dyn ControlPlane>,
    pub transfer: Arc<dyn FileTransfer>,
}

impl Collaborators {
    /// SQLite, Jenkins and the local warehouse, as configured.
    pub fn from_config(store: SqliteStore, config: &ManagerConfig) -> Self {
        let fleet = Arc::new(JenkinsFleet::new(store.clone(), &config.agents));
        let store = Arc::new(store);
        Self {
            catalogue: store.clone(),
            status: store.clone(),
            runs: store,
            agents: fleet.clone(),
            control: fleet,
            transfer: Arc::new(LocalWarehouse::new(&config.artifacts.warehouse_dir)),
        }
    }
}

fn communication_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COMMUNICATION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub struct Orchestrator {
    deps: Collaborators,
    renderer: PipelineRenderer,
    contract: MetricsContract,
    probe_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        deps: Collaborators,
        renderer: PipelineRenderer,
        contract: MetricsContract,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            deps,
            renderer,
            contract,
            probe_timeout,
        }
    }

    /// Wire the driver to the configured adapters.
    pub fn from_config(store: SqliteStore, config: &ManagerConfig) -> anyhow::Result<Self> {
        let renderer = PipelineRenderer::from_config(config)?;
        let contract = MetricsContract::load(&config.catalogue.metrics_contract_path)?;
        Ok(Self::new(
            Collaborators::from_config(store, config),
            renderer,
            contract,
            config.agents.probe_timeout(),
        ))
    }

    pub fn renderer(&self) -> &PipelineRenderer {
        &self.renderer
    }

    pub fn contract(&self) -> &MetricsContract {
        &self.contract
    }

    /// Log `state` as reached.
    fn mark(&self, run_id: i64, state: TestState) -> Result<(), OrchestrationError> {
        match self.deps.status.append_status(run_id, state, true) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(run_id, state, e.into())),
        }
    }

    /// Pass `result` through, logging `state` as failed on error.
    fn step<T, E>(&self, run_id: i64, state: TestState, result: Result<T, E>) -> Result<T, OrchestrationError>
    where
        E: Into<OrchestrationError>,
    {
        result.map_err(|e| self.fail(run_id, state, e.into()))
    }

    /// Log `state` as failed and hand back `err`.
    fn fail(&self, run_id: i64, state: TestState, err: OrchestrationError) -> OrchestrationError {
        warn!(run_id, %state, error = %err, "submission step failed");
        if let Err(log_err) = self.deps.status.append_status(run_id, state, false) {
            warn!(run_id, %state, error = %log_err, "failed to record step failure");
        }
        err
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Validate descriptor text (YAML or JSON) and dispatch it.
    pub async fn submit(&self, descriptor_text: &str) -> Result<SubmissionReceipt, OrchestrationError> {
        let descriptor = parse_descriptor_yaml(descriptor_text).map_err(OrchestrationError::Structural)?;
        self.submit_descriptor(descriptor).await
    }

    /// Validate an already parsed descriptor tree and dispatch it.
    pub async fn submit_value(
        &self,
        value: &serde_json::Value,
    ) -> Result<SubmissionReceipt, OrchestrationError> {
        let descriptor = parse_descriptor(value).map_err(OrchestrationError::Structural)?;
        self.submit_descriptor(descriptor).await
    }

    /// Semantic checks that do not need a run: testbed, catalogue,
    /// metrics contract and developer-defined artifacts.
    pub async fn check(
        &self,
        descriptor: &TestDescriptor,
    ) -> Result<Vec<ExecutedTest>, OrchestrationError> {
        let info = &descriptor.test_info;
        if self.deps.catalogue.get_testbed(&info.testbed_id)?.is_none() {
            return Err(OrchestrationError::TestbedNotFound(info.testbed_id.clone()));
        }

        let catalogue = self.deps.catalogue.get_tests(&info.testbed_id)?;
        let errors = validate_tests_parameters(descriptor, &catalogue);
        if !errors.is_empty() {
            return Err(OrchestrationError::Semantic(errors));
        }

        if !validate_metrics_collection_process(descriptor, &self.contract) {
            return Err(OrchestrationError::MetricsContract);
        }

        let executed = ExecutedTest::from_descriptor(descriptor);
        for test in executed.iter().filter(|t| t.is_developer_defined()) {
            let path = developer_defined_artifact_path(&info.netapp_id, &test.testcase.name);
            if !self.deps.transfer.exists(&path).await? {
                return Err(OrchestrationError::MissingDeveloperDefinedArtifact {
                    test: test.testcase.name.clone(),
                });
            }
        }
        Ok(executed)
    }

    pub async fn submit_descriptor(
        &self,
        descriptor: TestDescriptor,
    ) -> Result<SubmissionReceipt, OrchestrationError> {
        let executed = self.check(&descriptor).await?;
        let info = &descriptor.test_info;

        let run = self.deps.runs.create_run(&NewRun {
            netapp_id: info.netapp_id.clone(),
            network_service_id: info.network_service_id.clone(),
            testbed_id: info.testbed_id.clone(),
            access_token: uuid::Uuid::new_v4().to_string(),
        })?;
        let run_id = run.id;
        info!(run_id, testbed = %info.testbed_id, netapp = %info.netapp_id, "accepted descriptor");
        self.mark(run_id, TestState::SubmittedToCiCdManager)?;

        // Agent selection
        let agents = self.step(
            run_id,
            TestState::AuthenticatedOnCiCdAgent,
            self.deps.agents.list_agents(&info.testbed_id).await,
        )?;
        let Some((agent, probe)) =
            selection::select_agent(self.deps.agents.as_ref(), agents, self.probe_timeout).await
        else {
            let err = OrchestrationError::NoAgentAvailable {
                testbed: info.testbed_id.clone(),
            };
            return Err(self.fail(run_id, TestState::AuthenticatedOnCiCdAgent, err));
        };
        info!(run_id, agent_id = agent.id, url = %agent.url, active_jobs = probe.active_jobs, "selected agent");
        self.step(
            run_id,
            TestState::AuthenticatedOnCiCdAgent,
            self.deps.runs.set_run_agent(run_id, agent.id),
        )?;
        self.mark(run_id, TestState::AuthenticatedOnCiCdAgent)?;

        // Communication token
        let token = communication_token();
        let credential = communication_token_credential(run_id);
        let description = format!("Communication token for test run {run_id}");
        self.step(
            run_id,
            TestState::CreatedCommunicationTokenOnCiCdAgent,
            self.deps
                .control
                .create_credential(&agent, &credential, &token, &description)
                .await
                .map_err(OrchestrationError::CredentialProvisioning),
        )?;
        self.step(
            run_id,
            TestState::CreatedCommunicationTokenOnCiCdAgent,
            self.deps.runs.set_communication_token(run_id, &token),
        )?;
        self.mark(run_id, TestState::CreatedCommunicationTokenOnCiCdAgent)?;

        // Pipeline script
        let script: Result<String, OrchestrationError> = (|| {
            for test in &executed {
                let artifact_path = test
                    .is_developer_defined()
                    .then(|| developer_defined_artifact_path(&info.netapp_id, &test.testcase.name));
                self.deps.runs.add_run_test(
                    run_id,
                    &NewRunTest {
                        full_name: test.full_name.clone(),
                        description: test.testcase.description.clone(),
                        developer_defined: test.is_developer_defined(),
                        artifact_path,
                    },
                )?;
            }
            let catalogue = self.deps.catalogue.get_tests(&info.testbed_id)?;
            Ok(self.renderer.render(
                &executed,
                &catalogue,
                descriptor.metrics_collection(),
                &self.contract,
                run_id,
                &info.testbed_id,
            )?)
        })();
        let script = self.step(run_id, TestState::CreatedPipelineScript, script)?;
        self.mark(run_id, TestState::CreatedPipelineScript)?;

        // Job submission
        let job_name = format!("{}-{}-{}", info.netapp_id, info.network_service_id, run_id);
        let submitted: anyhow::Result<u64> = async {
            let job = self.deps.control.submit(&agent, &job_name, &script).await?;
            self.deps.control.start(&agent, &job).await
        }
        .await;
        let build_number = self.step(
            run_id,
            TestState::SubmittedPipelineScript,
            submitted.map_err(OrchestrationError::PipelineSubmission),
        )?;
        self.step(
            run_id,
            TestState::SubmittedPipelineScript,
            self.deps.runs.set_job(run_id, &job_name, Some(build_number)),
        )?;
        self.mark(run_id, TestState::SubmittedPipelineScript)?;

        info!(run_id, job = %job_name, build = build_number, "pipeline submitted");
        Ok(SubmissionReceipt {
            run_id,
            testbed_id: info.testbed_id.clone(),
            job_name,
            build_number,
            access_token: run.access_token,
        })
    }

    // -----------------------------------------------------------------------
    // Agent callbacks
    // -----------------------------------------------------------------------

    fn authorized_run(&self, run_id: i64, token: &str) -> Result<TestRun, OrchestrationError> {
        let run = self.run(run_id)?;
        match run.communication_token.as_deref() {
            Some(expected) if expected == token => Ok(run),
            _ => {
                warn!(run_id, "rejected callback with an invalid communication token");
                Err(OrchestrationError::Unauthorized(run_id))
            }
        }
    }

    /// Record a stage outcome reported by the agent running the pipeline.
    pub fn record_agent_status(
        &self,
        run_id: i64,
        token: &str,
        state: TestState,
        success: bool,
    ) -> Result<StatusEntry, OrchestrationError> {
        self.authorized_run(run_id, token)?;
        if !state.is_agent_reported() {
            return Err(StatusError::NotAgentReported(state).into());
        }
        Ok(self.deps.status.append_status(run_id, state, success)?)
    }

    /// Collect the published results of every test of a run, and archive
    /// the build console log next to them.
    pub async fn publish_results(
        &self,
        run_id: i64,
        token: &str,
        results_dir: &str,
    ) -> Result<Vec<RunTest>, OrchestrationError> {
        let run = self.authorized_run(run_id, token)?;
        let results_dir = results_dir.trim_end_matches('/');

        for test in self.deps.runs.list_run_tests(run_id)? {
            let path = format!("{results_dir}/{}/output.xml", test.full_name);
            let summary = match self.deps.transfer.download(&path).await {
                Ok(bytes) => results::parse_output_xml(&String::from_utf8_lossy(&bytes))
                    .map_err(|e| anyhow::anyhow!("{path}: {e}")),
                Err(e) => Err(e),
            };
            match summary {
                Ok(summary) => {
                    let start = summary.started_at.map(|t| t.format("%Y-%m-%d %H:%M:%S%.f").to_string());
                    let end = summary.ended_at.map(|t| t.format("%Y-%m-%d %H:%M:%S%.f").to_string());
                    self.deps.runs.record_test_result(
                        test.id,
                        summary.success(),
                        start.as_deref(),
                        end.as_deref(),
                    )?;
                    info!(run_id, test = %test.full_name, failed = summary.failed, passed = summary.passed, "recorded test result");
                }
                Err(e) => {
                    warn!(run_id, test = %test.full_name, error = %e, "no usable results, marking test failed");
                    self.deps.runs.record_test_result(test.id, false, None, None)?;
                }
            }
        }

        let log_location = format!("{results_dir}/console_log.log");
        let log: anyhow::Result<String> = async {
            let agent_id = run
                .agent_id
                .ok_or_else(|| anyhow::anyhow!("run {run_id} has no agent"))?;
            let agent = self
                .deps
                .agents
                .agent(agent_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("agent {agent_id} is no longer registered"))?;
            let job_name = run
                .job_name
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("run {run_id} has no job"))?;
            let build = match run.build_number {
                Some(build) => build,
                None => self.deps.control.last_build_number(&agent, job_name).await?,
            };
            self.deps.control.fetch_log(&agent, job_name, build).await
        }
        .await;
        let log = log.map_err(OrchestrationError::LogRetrieval)?;
        self.deps.transfer.upload(&log_location, log.as_bytes()).await?;
        self.deps
            .runs
            .set_result_locations(run_id, &log_location, results_dir)?;

        info!(run_id, results = %results_dir, "published test results");
        Ok(self.deps.runs.list_run_tests(run_id)?)
    }

    /// Archive of a developer-defined test of a run, for the agent to fetch.
    pub async fn developer_defined_test(
        &self,
        run_id: i64,
        token: &str,
        full_name: &str,
    ) -> Result<Vec<u8>, OrchestrationError> {
        self.authorized_run(run_id, token)?;
        let path = self
            .deps
            .runs
            .list_run_tests(run_id)?
            .into_iter()
            .find(|t| t.developer_defined && t.full_name == full_name)
            .and_then(|t| t.artifact_path)
            .ok_or_else(|| OrchestrationError::MissingDeveloperDefinedArtifact {
                test: full_name.to_string(),
            })?;
        Ok(self.deps.transfer.download(&path).await?)
    }

    /// Store a developer-defined test archive for later submissions.
    pub async fn upload_developer_defined(
        &self,
        netapp_id: &str,
        name: &str,
        archive: &[u8],
    ) -> Result<String, OrchestrationError> {
        if !is_valid_testcase_name(name) {
            return Err(OrchestrationError::InvalidTestName(name.to_string()));
        }
        let path = developer_defined_artifact_path(netapp_id, name);
        self.deps.transfer.upload(&path, archive).await?;
        info!(%netapp_id, test = %name, bytes = archive.len(), "stored developer-defined test");
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn run(&self, run_id: i64) -> Result<TestRun, OrchestrationError> {
        self.deps
            .runs
            .get_run(run_id)?
            .ok_or(OrchestrationError::RunNotFound(run_id))
    }

    /// Status log of a run, oldest first.
    pub fn status_log(&self, run_id: i64) -> Result<Vec<StatusEntry>, OrchestrationError> {
        self.run(run_id)?;
        Ok(self.deps.status.list_status(run_id)?)
    }

    /// Full report of a run for the holder of its access token.
    pub fn report(&self, run_id: i64, access_token: &str) -> Result<RunReport, OrchestrationError> {
        let run = self.run(run_id)?;
        if run.access_token != access_token {
            return Err(OrchestrationError::Unauthorized(run_id));
        }
        Ok(RunReport {
            run,
            status: self.deps.status.list_status(run_id)?,
            tests: self.deps.runs.list_run_tests(run_id)?,
        })
    }

    /// Tests offered by `testbed_id`.
    pub fn testbed_tests(&self, testbed_id: &str) -> Result<Vec<CatalogueEntry>, OrchestrationError> {
        if self.deps.catalogue.get_testbed(testbed_id)?.is_none() {
            return Err(OrchestrationError::TestbedNotFound(testbed_id.to_string()));
        }
        Ok(self.deps.catalogue.get_tests(testbed_id)?)
    }
}

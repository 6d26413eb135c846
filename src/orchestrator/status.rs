//! Run status states and the forward-only transition rule.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle states of a test run, in the only order they may be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestState {
    SubmittedToCiCdManager,
    AuthenticatedOnCiCdAgent,
    CreatedCommunicationTokenOnCiCdAgent,
    CreatedPipelineScript,
    SubmittedPipelineScript,
    EnvironmentSetupCiCdAgent,
    ObtainedMetricsCollectionFiles,
    StartedMonitoring,
    ObtainedTestsOnCiCdAgent,
    PerformedTestsOnCiCdAgent,
    EndedMonitoring,
    PublishedTestResults,
    CleanedTestEnvironment,
    TestEnded,
}

impl TestState {
    pub const ALL: [TestState; 14] = [
        TestState::SubmittedToCiCdManager,
        TestState::AuthenticatedOnCiCdAgent,
        TestState::CreatedCommunicationTokenOnCiCdAgent,
        TestState::CreatedPipelineScript,
        TestState::SubmittedPipelineScript,
        TestState::EnvironmentSetupCiCdAgent,
        TestState::ObtainedMetricsCollectionFiles,
        TestState::StartedMonitoring,
        TestState::ObtainedTestsOnCiCdAgent,
        TestState::PerformedTestsOnCiCdAgent,
        TestState::EndedMonitoring,
        TestState::PublishedTestResults,
        TestState::CleanedTestEnvironment,
        TestState::TestEnded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestState::SubmittedToCiCdManager => "SUBMITTED_TO_CI_CD_MANAGER",
            TestState::AuthenticatedOnCiCdAgent => "AUTHENTICATED_ON_CI_CD_AGENT",
            TestState::CreatedCommunicationTokenOnCiCdAgent => {
                "CREATED_COMMUNICATION_TOKEN_ON_CI_CD_AGENT"
            }
            TestState::CreatedPipelineScript => "CREATED_PIPELINE_SCRIPT",
            TestState::SubmittedPipelineScript => "SUBMITTED_PIPELINE_SCRIPT",
            TestState::EnvironmentSetupCiCdAgent => "ENVIRONMENT_SETUP_CI_CD_AGENT",
            TestState::ObtainedMetricsCollectionFiles => "OBTAINED_METRICS_COLLECTION_FILES",
            TestState::StartedMonitoring => "STARTED_MONITORING",
            TestState::ObtainedTestsOnCiCdAgent => "OBTAINED_TESTS_ON_CI_CD_AGENT",
            TestState::PerformedTestsOnCiCdAgent => "PERFORMED_TESTS_ON_CI_CD_AGENT",
            TestState::EndedMonitoring => "ENDED_MONITORING",
            TestState::PublishedTestResults => "PUBLISHED_TEST_RESULTS",
            TestState::CleanedTestEnvironment => "CLEANED_TEST_ENVIRONMENT",
            TestState::TestEnded => "TEST_ENDED",
        }
    }

    /// Position in the lifecycle, starting at 0.
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// States the running pipeline reports through the callback channel.
    pub fn is_agent_reported(&self) -> bool {
        *self > TestState::SubmittedPipelineScript
    }
}

impl std::fmt::Display for TestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown test state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for TestState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// One row of a run's status log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub run_id: i64,
    pub seq: i64,
    pub state: TestState,
    pub success: bool,
    /// RFC 3339 timestamp.
    pub recorded_at: String,
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("run {0} does not exist")]
    UnknownRun(i64),

    #[error("{requested} cannot be recorded after {latest}")]
    NotForward {
        latest: TestState,
        requested: TestState,
    },

    #[error("{0} is not reported by agents")]
    NotAgentReported(TestState),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Outcome of checking a requested entry against the latest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Record a new entry.
    Append,
    /// Exact repeat of the latest entry; nothing to record.
    Repeat,
}

/// Decide whether `(state, success)` may follow `latest`.
pub fn check_transition(
    latest: Option<(TestState, bool)>,
    state: TestState,
    success: bool,
) -> Result<Transition, StatusError> {
    match latest {
        None => Ok(Transition::Append),
        Some((l, s)) if l == state && s == success => Ok(Transition::Repeat),
        Some((l, _)) if state > l => Ok(Transition::Append),
        Some((l, _)) => Err(StatusError::NotForward {
            latest: l,
            requested: state,
        }),
    }
}

//! CI/CD agents: registry, liveness probing and the build control plane.
//!
//! The orchestrator only sees the [`AgentDirectory`] and [`ControlPlane`]
//! traits. [`jenkins::JenkinsFleet`] implements both on top of the agent
//! registry in SQLite and the Jenkins HTTP API.

pub mod jenkins;
pub mod job_config;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A registered CI/CD agent of a testbed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub testbed_id: String,
    pub url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("testbed_id", &self.testbed_id)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Result of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AgentProbe {
    pub reachable: bool,
    /// Builds currently running on the agent.
    pub active_jobs: usize,
}

impl AgentProbe {
    pub fn unreachable() -> Self {
        Self::default()
    }
}

/// A job created on an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub name: String,
}

/// Build number of a job run.
pub type BuildId = u64;

/// Lookup and probing of agents.
#[async_trait::async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Agents registered for `testbed_id`.
    async fn list_agents(&self, testbed_id: &str) -> Result<Vec<Agent>>;

    async fn agent(&self, id: i64) -> Result<Option<Agent>>;

    /// Probe `agent`. Any failure is reported as unreachable.
    async fn probe(&self, agent: &Agent) -> AgentProbe;
}

/// Job and credential management on an agent.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create a job named `job_name` running `script`.
    async fn submit(&self, agent: &Agent, job_name: &str, script: &str) -> Result<JobRef>;

    /// Trigger a build of `job` and return its build number.
    async fn start(&self, agent: &Agent, job: &JobRef) -> Result<BuildId>;

    /// Number of the most recent build of `job_name`.
    async fn last_build_number(&self, agent: &Agent, job_name: &str) -> Result<BuildId>;

    /// Console output of a build.
    async fn fetch_log(&self, agent: &Agent, job_name: &str, build: BuildId) -> Result<String>;

    /// Create (or replace) a secret text credential.
    async fn create_credential(
        &self,
        agent: &Agent,
        name: &str,
        value: &str,
        description: &str,
    ) -> Result<()>;
}

//! Shared fixtures: a seeded SQLite store, a local warehouse and an
//! in-memory agent fleet.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use cicd_manager::agents::{Agent, AgentDirectory, AgentProbe, BuildId, ControlPlane, JobRef};
use cicd_manager::catalog::{self, MetricsContract};
use cicd_manager::config::ManagerConfig;
use cicd_manager::orchestrator::{Collaborators, Orchestrator};
use cicd_manager::pipeline::{communication_token_credential, PipelineRenderer};
use cicd_manager::storage::{RunStore, SqliteStore};
use cicd_manager::transfer::LocalWarehouse;

pub const TESTBED: &str = "testbed_itav";
pub const BUILD_NUMBER: BuildId = 7;

pub fn repo_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative)
}

pub fn read_repo_file(relative: &str) -> String {
    std::fs::read_to_string(repo_path(relative)).unwrap()
}

pub fn bandwidth_descriptor() -> String {
    read_repo_file("demos/bandwidth_descriptor.yaml")
}

pub fn metrics_contract() -> MetricsContract {
    MetricsContract::load(&repo_path("static/metrics_collection.yaml")).unwrap()
}

pub fn catalogue() -> Vec<catalog::CatalogueEntry> {
    catalog::parse_tests_yaml(&read_repo_file("static/tests.yaml"))
        .unwrap()
        .into_iter()
        .filter(|e| e.testbed_id == TESTBED)
        .collect()
}

/// Agent fleet answering from memory.
#[derive(Default)]
pub struct FakeFleet {
    pub agents: Vec<Agent>,
    pub probes: HashMap<i64, AgentProbe>,
    pub fail_credentials: bool,
    pub fail_submission: bool,
    /// `(agent id, name, value)` of every created credential.
    pub credentials: Mutex<Vec<(i64, String, String)>>,
    /// `(agent id, job name, script)` of every submitted job.
    pub jobs: Mutex<Vec<(i64, String, String)>>,
}

impl FakeFleet {
    /// One reachable, idle agent with id `id`.
    pub fn with_agent(id: i64) -> Self {
        let mut fleet = Self::default();
        fleet.add(id, AgentProbe { reachable: true, active_jobs: 0 });
        fleet
    }

    pub fn add(&mut self, id: i64, probe: AgentProbe) {
        self.agents.push(Agent {
            id,
            testbed_id: TESTBED.to_string(),
            url: format!("http://agent-{id}:8080"),
            username: "admin".to_string(),
            password: "admin".to_string(),
        });
        self.probes.insert(id, probe);
    }

    pub fn token(&self) -> String {
        self.credentials.lock().unwrap().last().unwrap().2.clone()
    }

    /// Communication token provisioned for `run_id`.
    pub fn token_for(&self, run_id: i64) -> String {
        let name = communication_token_credential(run_id);
        self.credentials
            .lock()
            .unwrap()
            .iter()
            .find(|(_, n, _)| *n == name)
            .unwrap()
            .2
            .clone()
    }

    pub fn last_script(&self) -> String {
        self.jobs.lock().unwrap().last().unwrap().2.clone()
    }
}

#[async_trait::async_trait]
impl AgentDirectory for FakeFleet {
    async fn list_agents(&self, testbed_id: &str) -> Result<Vec<Agent>> {
        Ok(self
            .agents
            .iter()
            .filter(|a| a.testbed_id == testbed_id)
            .cloned()
            .collect())
    }

    async fn agent(&self, id: i64) -> Result<Option<Agent>> {
        Ok(self.agents.iter().find(|a| a.id == id).cloned())
    }

    async fn probe(&self, agent: &Agent) -> AgentProbe {
        self.probes.get(&agent.id).copied().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ControlPlane for FakeFleet {
    async fn submit(&self, agent: &Agent, job_name: &str, script: &str) -> Result<JobRef> {
        if self.fail_submission {
            bail!("createItem returned HTTP 500");
        }
        self.jobs
            .lock()
            .unwrap()
            .push((agent.id, job_name.to_string(), script.to_string()));
        Ok(JobRef {
            name: job_name.to_string(),
        })
    }

    async fn start(&self, _agent: &Agent, _job: &JobRef) -> Result<BuildId> {
        Ok(BUILD_NUMBER)
    }

    async fn last_build_number(&self, _agent: &Agent, _job_name: &str) -> Result<BuildId> {
        Ok(BUILD_NUMBER)
    }

    async fn fetch_log(&self, _agent: &Agent, job_name: &str, build: BuildId) -> Result<String> {
        Ok(format!("Started {job_name} #{build}\nFinished: SUCCESS\n"))
    }

    async fn create_credential(&self, agent: &Agent, name: &str, value: &str, _description: &str) -> Result<()> {
        if self.fail_credentials {
            bail!("credential store rejected the request");
        }
        self.credentials
            .lock()
            .unwrap()
            .push((agent.id, name.to_string(), value.to_string()));
        Ok(())
    }
}

/// A manager wired to a temporary database and warehouse.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: SqliteStore,
    pub warehouse: LocalWarehouse,
    pub fleet: Arc<FakeFleet>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    /// Fake agents must be numbered 1.. so their ids match the rows the
    /// agent registry assigns.
    pub fn new(mut fleet: FakeFleet) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("manager.db").to_str().unwrap()).unwrap();
        catalog::import_catalogue(
            &store,
            &repo_path("static/testbeds.yaml"),
            &repo_path("static/tests.yaml"),
        )
        .unwrap();

        fleet.agents.sort_by_key(|a| a.id);
        for agent in &fleet.agents {
            let id = store
                .add_agent(&agent.testbed_id, &agent.url, &agent.username, &agent.password)
                .unwrap();
            assert_eq!(id, agent.id, "fake agent ids must start at 1 without gaps");
        }

        let warehouse = LocalWarehouse::new(dir.path().join("warehouse"));
        let fleet = Arc::new(fleet);
        Self {
            orchestrator: build(&store, &warehouse, &fleet, Arc::new(store.clone())),
            dir,
            store,
            warehouse,
            fleet,
        }
    }

    /// A second driver over the same database, fleet and warehouse that
    /// keeps runs in `runs`.
    pub fn with_runs(&self, runs: Arc<dyn RunStore>) -> Orchestrator {
        build(&self.store, &self.warehouse, &self.fleet, runs)
    }
}

fn build(
    store: &SqliteStore,
    warehouse: &LocalWarehouse,
    fleet: &Arc<FakeFleet>,
    runs: Arc<dyn RunStore>,
) -> Orchestrator {
    let store = Arc::new(store.clone());
    let deps = Collaborators {
        catalogue: store.clone(),
        status: store,
        runs,
        agents: fleet.clone(),
        control: fleet.clone(),
        transfer: Arc::new(warehouse.clone()),
    };
    let renderer = PipelineRenderer::from_config(&ManagerConfig::default()).unwrap();
    Orchestrator::new(deps, renderer, metrics_contract(), Duration::from_secs(1))
}

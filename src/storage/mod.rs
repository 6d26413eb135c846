//! SQLite storage layer -- catalogue, agents, runs and the status log.

pub mod schema;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::agents::Agent;
use crate::catalog::{CatalogueEntry, TestVariable, Testbed};
use crate::orchestrator::status::{check_transition, StatusEntry, StatusError, TestState, Transition};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Fields known when a run is created.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub netapp_id: String,
    pub network_service_id: String,
    pub testbed_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRun {
    pub id: i64,
    pub netapp_id: String,
    pub network_service_id: String,
    pub testbed_id: String,
    pub agent_id: Option<i64>,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub communication_token: Option<String>,
    pub job_name: Option<String>,
    pub build_number: Option<u64>,
    pub log_location: Option<String>,
    pub results_location: Option<String>,
    pub created_at: String,
}

/// Per executed test of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunTest {
    pub id: i64,
    pub run_id: i64,
    pub full_name: String,
    pub description: Option<String>,
    pub developer_defined: bool,
    pub artifact_path: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub success: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewRunTest {
    pub full_name: String,
    pub description: Option<String>,
    pub developer_defined: bool,
    pub artifact_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

/// Testbeds and the tests they offer.
pub trait CatalogueStore: Send + Sync {
    fn get_tests(&self, testbed_id: &str) -> Result<Vec<CatalogueEntry>>;
    fn get_testbed(&self, id: &str) -> Result<Option<Testbed>>;
    fn upsert_testbed(&self, testbed: &Testbed) -> Result<()>;
    /// Insert or replace the entry keyed by `(testbed_id, test_id)`.
    fn upsert_test(&self, entry: &CatalogueEntry) -> Result<()>;
}

/// Append-only status log per run.
pub trait StatusStore: Send + Sync {
    /// Record `(state, success)` for `run_id`.
    ///
    /// Returns the latest entry after the call; an exact repeat of the latest
    /// entry returns it unchanged.
    fn append_status(&self, run_id: i64, state: TestState, success: bool)
        -> Result<StatusEntry, StatusError>;
    fn list_status(&self, run_id: i64) -> Result<Vec<StatusEntry>>;
}

/// Runs and their executed tests.
pub trait RunStore: Send + Sync {
    fn create_run(&self, run: &NewRun) -> Result<TestRun>;
    fn get_run(&self, run_id: i64) -> Result<Option<TestRun>>;
    fn set_run_agent(&self, run_id: i64, agent_id: i64) -> Result<()>;
    fn set_communication_token(&self, run_id: i64, token: &str) -> Result<()>;
    fn set_job(&self, run_id: i64, job_name: &str, build_number: Option<u64>) -> Result<()>;
    fn set_result_locations(&self, run_id: i64, log_location: &str, results_location: &str) -> Result<()>;
    fn add_run_test(&self, run_id: i64, test: &NewRunTest) -> Result<RunTest>;
    fn list_run_tests(&self, run_id: i64) -> Result<Vec<RunTest>>;
    fn record_test_result(
        &self,
        run_test_id: i64,
        success: bool,
        started_at: Option<&str>,
        ended_at: Option<&str>,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

const RUN_COLUMNS: &str = "id, netapp_id, network_service_id, testbed_id, agent_id, access_token,
     communication_token, job_name, build_number, log_location, results_location, created_at";

const RUN_TEST_COLUMNS: &str =
    "id, run_id, full_name, description, developer_defined, artifact_path, started_at, ended_at, success";

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestRun> {
    Ok(TestRun {
        id: row.get(0)?,
        netapp_id: row.get(1)?,
        network_service_id: row.get(2)?,
        testbed_id: row.get(3)?,
        agent_id: row.get(4)?,
        access_token: row.get(5)?,
        communication_token: row.get(6)?,
        job_name: row.get(7)?,
        build_number: row.get::<_, Option<i64>>(8)?.map(|n| n as u64),
        log_location: row.get(9)?,
        results_location: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn run_test_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunTest> {
    Ok(RunTest {
        id: row.get(0)?,
        run_id: row.get(1)?,
        full_name: row.get(2)?,
        description: row.get(3)?,
        developer_defined: row.get(4)?,
        artifact_path: row.get(5)?,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
        success: row.get(8)?,
    })
}

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        testbed_id: row.get(1)?,
        url: row.get(2)?,
        username: row.get(3)?,
        password: row.get(4)?,
    })
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open the database at `path`, running migrations.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn list_testbeds(&self) -> Result<Vec<Testbed>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT id, name, description FROM testbeds ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Testbed {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Register an agent, updating its credentials when `(testbed_id, url)`
    /// already exists. Returns the agent id.
    pub fn add_agent(&self, testbed_id: &str, url: &str, username: &str, password: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        let id: i64 = conn
            .query_row(
                "INSERT INTO agents (testbed_id, url, username, password)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(testbed_id, url)
                 DO UPDATE SET username = excluded.username, password = excluded.password
                 RETURNING id",
                params![testbed_id, url.trim_end_matches('/'), username, password],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to register agent {url} for testbed {testbed_id}"))?;
        tracing::info!(agent_id = id, %testbed_id, %url, "registered agent");
        Ok(id)
    }

    /// Agents of `testbed_id`, ascending by id.
    pub fn agents_for_testbed(&self, testbed_id: &str) -> Result<Vec<Agent>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, testbed_id, url, username, password FROM agents
             WHERE testbed_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![testbed_id], agent_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_agent(&self, id: i64) -> Result<Option<Agent>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT id, testbed_id, url, username, password FROM agents WHERE id = ?1",
                params![id],
                agent_from_row,
            )
            .optional()?)
    }

    pub fn list_runs(&self) -> Result<Vec<TestRun>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM test_runs ORDER BY id"))?;
        let rows = stmt.query_map([], run_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl CatalogueStore for SqliteStore {
    fn get_tests(&self, testbed_id: &str) -> Result<Vec<CatalogueEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT testbed_id, test_id, name, description, ftp_base_location, test_filename,
                    test_type, variables_json
             FROM catalogue_tests WHERE testbed_id = ?1 ORDER BY test_id",
        )?;
        let rows = stmt.query_map(params![testbed_id], |row| {
            Ok((
                CatalogueEntry {
                    testbed_id: row.get(0)?,
                    test_id: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                    ftp_base_location: row.get(4)?,
                    test_filename: row.get(5)?,
                    test_type: row.get(6)?,
                    variables: Vec::new(),
                },
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (mut entry, variables_json) = row?;
            entry.variables = serde_json::from_str::<Vec<TestVariable>>(&variables_json)
                .with_context(|| format!("corrupt variables for test {}", entry.test_id))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn get_testbed(&self, id: &str) -> Result<Option<Testbed>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT id, name, description FROM testbeds WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Testbed {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn upsert_testbed(&self, testbed: &Testbed) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO testbeds (id, name, description) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description",
            params![testbed.id, testbed.name, testbed.description],
        )?;
        Ok(())
    }

    fn upsert_test(&self, entry: &CatalogueEntry) -> Result<()> {
        let conn = self.pool.get()?;
        let variables_json = serde_json::to_string(&entry.variables)?;
        conn.execute(
            "INSERT INTO catalogue_tests (testbed_id, test_id, name, description, ftp_base_location,
                                          test_filename, test_type, variables_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
             ON CONFLICT(testbed_id, test_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                ftp_base_location = excluded.ftp_base_location,
                test_filename = excluded.test_filename,
                test_type = excluded.test_type,
                variables_json = excluded.variables_json,
                updated_at = excluded.updated_at",
            params![
                entry.testbed_id,
                entry.test_id,
                entry.name,
                entry.description,
                entry.ftp_base_location,
                entry.test_filename,
                entry.test_type,
                variables_json
            ],
        )
        .with_context(|| format!("failed to store test {} of testbed {}", entry.test_id, entry.testbed_id))?;
        Ok(())
    }
}

impl StatusStore for SqliteStore {
    fn append_status(
        &self,
        run_id: i64,
        state: TestState,
        success: bool,
    ) -> Result<StatusEntry, StatusError> {
        let mut conn = self.pool.get().context("status store unavailable")?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin status transaction")?;

        let exists: bool = tx
            .query_row("SELECT EXISTS(SELECT 1 FROM test_runs WHERE id = ?1)", params![run_id], |r| r.get(0))
            .context("failed to look up run")?;
        if !exists {
            return Err(StatusError::UnknownRun(run_id));
        }

        let latest = tx
            .query_row(
                "SELECT seq, state, success, recorded_at FROM run_status
                 WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![run_id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, bool>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to read latest status")?;

        let latest = match latest {
            Some((seq, state_str, ok, recorded_at)) => {
                let latest_state: TestState = state_str.parse().map_err(anyhow::Error::from)?;
                Some(StatusEntry {
                    run_id,
                    seq,
                    state: latest_state,
                    success: ok,
                    recorded_at,
                })
            }
            None => None,
        };

        match check_transition(latest.as_ref().map(|e| (e.state, e.success)), state, success)? {
            Transition::Repeat => {
                tracing::debug!(run_id, %state, success, "ignoring repeated status");
                // A repeat implies a latest entry exists.
                latest.ok_or_else(|| StatusError::Storage(anyhow::anyhow!("missing latest status")))
            }
            Transition::Append => {
                let entry = StatusEntry {
                    run_id,
                    seq: latest.map(|e| e.seq + 1).unwrap_or(0),
                    state,
                    success,
                    recorded_at: now(),
                };
                tx.execute(
                    "INSERT INTO run_status (run_id, seq, state, success, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![entry.run_id, entry.seq, entry.state.as_str(), entry.success, entry.recorded_at],
                )
                .context("failed to append status")?;
                tx.commit().context("failed to commit status")?;
                tracing::info!(run_id, %state, success, seq = entry.seq, "recorded run status");
                Ok(entry)
            }
        }
    }

    fn list_status(&self, run_id: i64) -> Result<Vec<StatusEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT seq, state, success, recorded_at FROM run_status
             WHERE run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![run_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, bool>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, state, success, recorded_at) = row?;
            entries.push(StatusEntry {
                run_id,
                seq,
                state: state.parse()?,
                success,
                recorded_at,
            });
        }
        Ok(entries)
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, run: &NewRun) -> Result<TestRun> {
        let conn = self.pool.get()?;
        let created = conn
            .query_row(
                &format!(
                    "INSERT INTO test_runs (netapp_id, network_service_id, testbed_id, access_token, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     RETURNING {RUN_COLUMNS}"
                ),
                params![run.netapp_id, run.network_service_id, run.testbed_id, run.access_token, now()],
                run_from_row,
            )
            .context("failed to create run")?;
        Ok(created)
    }

    fn get_run(&self, run_id: i64) -> Result<Option<TestRun>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM test_runs WHERE id = ?1"),
                params![run_id],
                run_from_row,
            )
            .optional()?)
    }

    fn set_run_agent(&self, run_id: i64, agent_id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE test_runs SET agent_id = ?2 WHERE id = ?1",
            params![run_id, agent_id],
        )?;
        Ok(())
    }

    fn set_communication_token(&self, run_id: i64, token: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE test_runs SET communication_token = ?2 WHERE id = ?1",
            params![run_id, token],
        )?;
        Ok(())
    }

    fn set_job(&self, run_id: i64, job_name: &str, build_number: Option<u64>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE test_runs SET job_name = ?2, build_number = ?3 WHERE id = ?1",
            params![run_id, job_name, build_number.map(|n| n as i64)],
        )?;
        Ok(())
    }

    fn set_result_locations(&self, run_id: i64, log_location: &str, results_location: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE test_runs SET log_location = ?2, results_location = ?3 WHERE id = ?1",
            params![run_id, log_location, results_location],
        )?;
        Ok(())
    }

    fn add_run_test(&self, run_id: i64, test: &NewRunTest) -> Result<RunTest> {
        let conn = self.pool.get()?;
        let created = conn
            .query_row(
                &format!(
                    "INSERT INTO run_tests (run_id, full_name, description, developer_defined, artifact_path)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     RETURNING {RUN_TEST_COLUMNS}"
                ),
                params![
                    run_id,
                    test.full_name,
                    test.description,
                    test.developer_defined,
                    test.artifact_path
                ],
                run_test_from_row,
            )
            .with_context(|| format!("failed to register test {} for run {run_id}", test.full_name))?;
        Ok(created)
    }

    fn list_run_tests(&self, run_id: i64) -> Result<Vec<RunTest>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_TEST_COLUMNS} FROM run_tests WHERE run_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![run_id], run_test_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn record_test_result(
        &self,
        run_test_id: i64,
        success: bool,
        started_at: Option<&str>,
        ended_at: Option<&str>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE run_tests SET success = ?2, started_at = ?3, ended_at = ?4 WHERE id = ?1",
            params![run_test_id, success, started_at, ended_at],
        )?;
        Ok(())
    }
}

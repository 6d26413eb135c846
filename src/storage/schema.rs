//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS testbeds (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS catalogue_tests (
            id INTEGER PRIMARY KEY,
            testbed_id TEXT NOT NULL REFERENCES testbeds(id),
            test_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            ftp_base_location TEXT NOT NULL,
            test_filename TEXT NOT NULL,
            test_type TEXT NOT NULL DEFAULT '',
            variables_json TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(testbed_id, test_id)
        );

        CREATE TABLE IF NOT EXISTS agents (
            id INTEGER PRIMARY KEY,
            testbed_id TEXT NOT NULL REFERENCES testbeds(id),
            url TEXT NOT NULL,
            username TEXT NOT NULL,
            password TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(testbed_id, url)
        );

        CREATE TABLE IF NOT EXISTS test_runs (
            id INTEGER PRIMARY KEY,
            netapp_id TEXT NOT NULL,
            network_service_id TEXT NOT NULL,
            testbed_id TEXT NOT NULL REFERENCES testbeds(id),
            agent_id INTEGER REFERENCES agents(id),
            access_token TEXT NOT NULL UNIQUE,
            communication_token TEXT,
            job_name TEXT,
            build_number INTEGER,
            log_location TEXT,
            results_location TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS run_status (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL REFERENCES test_runs(id),
            seq INTEGER NOT NULL,
            state TEXT NOT NULL,
            success INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            UNIQUE(run_id, seq)
        );

        CREATE TABLE IF NOT EXISTS run_tests (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL REFERENCES test_runs(id),
            full_name TEXT NOT NULL,
            description TEXT,
            developer_defined INTEGER NOT NULL DEFAULT 0,
            artifact_path TEXT,
            started_at TEXT,
            ended_at TEXT,
            success INTEGER,
            UNIQUE(run_id, full_name)
        );

        CREATE INDEX IF NOT EXISTS idx_catalogue_testbed ON catalogue_tests(testbed_id);
        CREATE INDEX IF NOT EXISTS idx_agents_testbed ON agents(testbed_id);
        CREATE INDEX IF NOT EXISTS idx_run_status_run ON run_status(run_id, seq);
        CREATE INDEX IF NOT EXISTS idx_run_tests_run ON run_tests(run_id);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        rusqlite::params![SCHEMA_VERSION],
    )?;

    Ok(())
}

//! cicd-manager -- validates testing descriptors and runs them as CI/CD
//! pipelines on testbed agents.
//!
//! This crate provides descriptor validation, pipeline rendering, agent
//! selection and the run status log, plus the HTTP surface agents call back
//! into while a pipeline runs.

pub mod agents;
pub mod api;
pub mod catalog;
pub mod config;
pub mod descriptor;
pub mod orchestrator;
pub mod pipeline;
pub mod storage;
pub mod transfer;
pub mod validator;

use anyhow::{Context, Result};

use crate::config::ManagerConfig;
use crate::storage::SqliteStore;

/// Open the configured database.
pub fn open_store(config: &ManagerConfig) -> Result<SqliteStore> {
    let db_path = config.storage.db_path.to_string_lossy();
    tracing::info!(%db_path, "Initializing database");
    SqliteStore::open(&db_path)
}

/// Start the manager: seed the catalogue, then serve the API.
pub async fn serve(config: ManagerConfig) -> Result<()> {
    // 1. Initialize Storage
    let store = open_store(&config)?;

    // 2. Seed the catalogue when the files are present
    let catalogue = &config.catalogue;
    if catalogue.testbeds_path.exists() && catalogue.tests_path.exists() {
        catalog::import_catalogue(&store, &catalogue.testbeds_path, &catalogue.tests_path)
            .context("failed to import the testbed catalogue")?;
    } else {
        tracing::warn!(
            testbeds = %catalogue.testbeds_path.display(),
            tests = %catalogue.tests_path.display(),
            "catalogue files not found, serving the stored catalogue"
        );
    }

    // 3. Start API Server
    let orchestrator = orchestrator::Orchestrator::from_config(store, &config)?;
    let app = api::router(api::state::AppState::new(orchestrator));

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    tracing::info!(%addr, manager_url = %config.manager.url, "cicd-manager listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use cicd_manager::catalog::{self, CatalogueEntry, MetricsContract};
use cicd_manager::config::ManagerConfig;
use cicd_manager::descriptor::TestDescriptor;
use cicd_manager::pipeline::{ExecutedTest, PipelineRenderer};
use cicd_manager::storage::StatusStore;
use cicd_manager::validator;

#[derive(Parser)]
#[command(
    name = "cicd-manager",
    about = "Validates testing descriptors and runs them as CI/CD pipelines on testbed agents",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $CICD_MANAGER_CONFIG, then /etc/cicd-manager/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Bind address (overrides the configuration)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Validate a testing descriptor against the catalogue files
    Validate {
        /// Descriptor file (YAML or JSON)
        descriptor: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Render the pipeline script of a descriptor without submitting it
    Render {
        /// Descriptor file (YAML or JSON)
        descriptor: PathBuf,

        /// Test instance id baked into the status callbacks
        #[arg(long, default_value = "0")]
        test_id: i64,

        /// Write the script here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Manage the testbed catalogue
    Catalogue {
        #[command(subcommand)]
        action: CatalogueAction,
    },

    /// Manage CI/CD agents
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },

    /// Show runs, or the status log of one run
    Status {
        /// Run id
        #[arg(long)]
        run_id: Option<i64>,
    },
}

#[derive(Subcommand)]
enum CatalogueAction {
    /// Import the testbeds and tests files into the database
    Import {
        /// Testbeds file (overrides the configuration)
        #[arg(long)]
        testbeds: Option<PathBuf>,

        /// Tests file (overrides the configuration)
        #[arg(long)]
        tests: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// Register an agent, or update its credentials
    Add {
        #[arg(long)]
        testbed: String,

        /// Agent base URL
        #[arg(long)]
        url: String,

        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,
    },

    /// List the agents of a testbed
    List {
        #[arg(long)]
        testbed: String,
    },
}

fn init_tracing(config: &ManagerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_descriptor(path: &Path) -> Result<TestDescriptor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read descriptor {}", path.display()))?;
    validator::parse_descriptor_yaml(&text).map_err(|errors| {
        for e in &errors {
            eprintln!("  {e}");
        }
        anyhow::anyhow!("descriptor is malformed ({} errors)", errors.len())
    })
}

fn catalogue_for(config: &ManagerConfig, testbed_id: &str) -> Result<Vec<CatalogueEntry>> {
    let path = &config.catalogue.tests_path;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tests catalogue {}", path.display()))?;
    Ok(catalog::parse_tests_yaml(&content)?
        .into_iter()
        .filter(|e| e.testbed_id == testbed_id)
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::load_or_default(),
    };
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting cicd-manager");
            cicd_manager::serve(config).await?;
        }
        Commands::Validate { descriptor, json } => {
            let descriptor = read_descriptor(&descriptor)?;
            let testbed = &descriptor.test_info.testbed_id;
            let catalogue = catalogue_for(&config, testbed)?;
            let contract = MetricsContract::load(&config.catalogue.metrics_contract_path)?;

            let errors = validator::validate_tests_parameters(&descriptor, &catalogue);
            let metrics_ok = validator::validate_metrics_collection_process(&descriptor, &contract);

            if json {
                let report = serde_json::json!({
                    "testbed_id": testbed,
                    "errors": errors,
                    "metrics_collection_valid": metrics_ok,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for e in &errors {
                    println!("  {e}");
                }
                if !metrics_ok {
                    println!("  Badly defined parameters for the metrics collection process");
                }
            }
            if !errors.is_empty() || !metrics_ok {
                bail!("descriptor is not valid for testbed {testbed}");
            }
            if !json {
                println!("Descriptor is valid for testbed {testbed}.");
            }
        }
        Commands::Render {
            descriptor,
            test_id,
            output,
        } => {
            let descriptor = read_descriptor(&descriptor)?;
            let testbed = &descriptor.test_info.testbed_id;
            let catalogue = catalogue_for(&config, testbed)?;
            let contract = MetricsContract::load(&config.catalogue.metrics_contract_path)?;
            let renderer = PipelineRenderer::from_config(&config)?;

            let script = renderer.render(
                &ExecutedTest::from_descriptor(&descriptor),
                &catalogue,
                descriptor.metrics_collection(),
                &contract,
                test_id,
                testbed,
            )?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &script)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Pipeline script written to {}", path.display());
                }
                None => print!("{script}"),
            }
        }
        Commands::Catalogue { action } => match action {
            CatalogueAction::Import { testbeds, tests } => {
                let store = cicd_manager::open_store(&config)?;
                let testbeds = testbeds.unwrap_or(config.catalogue.testbeds_path.clone());
                let tests = tests.unwrap_or(config.catalogue.tests_path.clone());
                let (testbeds, tests) = catalog::import_catalogue(&store, &testbeds, &tests)?;
                println!("Imported {testbeds} testbeds and {tests} tests.");
            }
        },
        Commands::Agents { action } => {
            let store = cicd_manager::open_store(&config)?;
            match action {
                AgentsAction::Add {
                    testbed,
                    url,
                    username,
                    password,
                } => {
                    let id = store.add_agent(&testbed, &url, &username, &password)?;
                    println!("Agent {id} registered for testbed '{testbed}'.");
                }
                AgentsAction::List { testbed } => {
                    let agents = store.agents_for_testbed(&testbed)?;
                    if agents.is_empty() {
                        println!("No agents registered for testbed '{testbed}'.");
                    } else {
                        println!("{:<6} | {:<40} | User", "Id", "Url");
                        println!("{:-<6}-|-{:-<40}-|-{:-<12}", "", "", "");
                        for agent in agents {
                            println!("{:<6} | {:<40} | {}", agent.id, agent.url, agent.username);
                        }
                    }
                }
            }
        }
        Commands::Status { run_id } => {
            let store = cicd_manager::open_store(&config)?;
            match run_id {
                Some(run_id) => {
                    let log = store.list_status(run_id)?;
                    if log.is_empty() {
                        println!("No status recorded for run {run_id}.");
                    }
                    for entry in log {
                        let outcome = if entry.success { "OK" } else { "FAILED" };
                        println!("{:<35} | {:<32} | {}", entry.recorded_at, entry.state.as_str(), outcome);
                    }
                }
                None => {
                    let runs = store.list_runs()?;
                    if runs.is_empty() {
                        println!("No runs found.");
                    } else {
                        println!("{:<6} | {:<20} | {:<30} | Build", "Run", "Testbed", "Job");
                        println!("{:-<6}-|-{:-<20}-|-{:-<30}-|-{:-<6}", "", "", "", "");
                        for run in runs {
                            println!(
                                "{:<6} | {:<20} | {:<30} | {}",
                                run.id,
                                run.testbed_id,
                                run.job_name.as_deref().unwrap_or("-"),
                                run.build_number.map(|b| b.to_string()).unwrap_or_else(|| "-".into())
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

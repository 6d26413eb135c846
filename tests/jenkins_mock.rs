//! Jenkins client and fleet against an in-process mock Jenkins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{json, Value};

use cicd_manager::agents::jenkins::{JenkinsClient, JenkinsError, JenkinsFleet};
use cicd_manager::agents::{AgentDirectory, ControlPlane, JobRef};
use cicd_manager::catalog::Testbed;
use cicd_manager::config::AgentsConfig;
use cicd_manager::storage::{CatalogueStore, SqliteStore};

const ADMIN_AUTH: &str = "Basic YWRtaW46c2VjcmV0"; // admin:secret
const TOKEN_AUTH: &str = "Basic YWRtaW46MTFhYmNkZWY="; // admin:11abcdef
const CRUMB: &str = "c0ffee";

#[derive(Default)]
struct Jenkins {
    /// job name -> (config.xml, next build number)
    jobs: HashMap<String, (String, u64)>,
    credentials: HashMap<String, String>,
    deletes: usize,
    /// Uuids of API tokens issued and not yet revoked.
    live_tokens: Vec<String>,
    revoked: Vec<String>,
    reject_credentials: bool,
}

type Shared = Arc<Mutex<Jenkins>>;

fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

fn has_crumb(headers: &HeaderMap) -> bool {
    headers
        .get("Jenkins-Crumb")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == CRUMB)
}

async fn whoami(headers: HeaderMap) -> Response {
    if !authorized(&headers, ADMIN_AUTH) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "id": "admin", "fullName": "Administrator" })).into_response()
}

async fn crumb() -> Json<Value> {
    Json(json!({ "crumb": CRUMB, "crumbRequestField": "Jenkins-Crumb" }))
}

async fn jobs() -> Json<Value> {
    Json(json!({
        "jobs": [
            { "color": "blue_anime" },
            { "color": "red" },
            { "color": "notbuilt_anime" },
            { "name": "folder" }
        ]
    }))
}

async fn create_item(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: String,
) -> StatusCode {
    if !has_crumb(&headers) {
        return StatusCode::FORBIDDEN;
    }
    let Some(name) = q.get("name") else {
        return StatusCode::BAD_REQUEST;
    };
    let mut jenkins = state.lock().unwrap();
    if jenkins.jobs.contains_key(name) {
        return StatusCode::BAD_REQUEST;
    }
    jenkins.jobs.insert(name.clone(), (body, 1));
    StatusCode::OK
}

async fn job_info(State(state): State<Shared>, Path(name): Path<String>) -> Response {
    let jenkins = state.lock().unwrap();
    match jenkins.jobs.get(&name) {
        Some((_, next)) => {
            let last = (*next > 1).then(|| json!({ "number": next - 1 }));
            Json(json!({ "nextBuildNumber": next, "lastBuild": last })).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn build(State(state): State<Shared>, headers: HeaderMap, Path(name): Path<String>) -> StatusCode {
    if !has_crumb(&headers) {
        return StatusCode::FORBIDDEN;
    }
    let mut jenkins = state.lock().unwrap();
    match jenkins.jobs.get_mut(&name) {
        Some((_, next)) => {
            *next += 1;
            StatusCode::CREATED
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn console(Path((name, build)): Path<(String, u64)>) -> String {
    format!("Started by user admin\n[Pipeline] {name} #{build}\nFinished: SUCCESS\n")
}

async fn generate_token(
    State(state): State<Shared>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers, ADMIN_AUTH) || !has_crumb(&headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    state.lock().unwrap().live_tokens.push("0b6c".to_string());
    Json(json!({
        "status": "ok",
        "data": {
            "tokenName": form.get("newTokenName"),
            "tokenUuid": "0b6c",
            "tokenValue": "11abcdef"
        }
    }))
    .into_response()
}

async fn revoke_token(
    State(state): State<Shared>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> StatusCode {
    if !authorized(&headers, ADMIN_AUTH) || !has_crumb(&headers) {
        return StatusCode::FORBIDDEN;
    }
    let Some(uuid) = form.get("tokenUuid") else {
        return StatusCode::BAD_REQUEST;
    };
    let mut jenkins = state.lock().unwrap();
    match jenkins.live_tokens.iter().position(|t| t == uuid) {
        Some(i) => {
            jenkins.live_tokens.remove(i);
            jenkins.revoked.push(uuid.clone());
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn delete_credential(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> StatusCode {
    if !authorized(&headers, TOKEN_AUTH) {
        return StatusCode::UNAUTHORIZED;
    }
    let mut jenkins = state.lock().unwrap();
    jenkins.deletes += 1;
    match jenkins.credentials.remove(&name) {
        Some(_) => StatusCode::OK,
        None => StatusCode::NOT_FOUND,
    }
}

async fn create_credentials(
    State(state): State<Shared>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> StatusCode {
    if !authorized(&headers, TOKEN_AUTH) || !has_crumb(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let Some(payload) = form.get("json").and_then(|j| serde_json::from_str::<Value>(j).ok()) else {
        return StatusCode::BAD_REQUEST;
    };
    let credentials = &payload["credentials"];
    let (Some(id), Some(secret)) = (credentials["id"].as_str(), credentials["secret"].as_str()) else {
        return StatusCode::BAD_REQUEST;
    };
    let mut jenkins = state.lock().unwrap();
    if jenkins.reject_credentials {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    if jenkins.credentials.contains_key(id) {
        return StatusCode::CONFLICT;
    }
    jenkins.credentials.insert(id.to_string(), secret.to_string());
    StatusCode::OK
}

async fn mock_jenkins() -> (String, Shared) {
    let state: Shared = Arc::new(Mutex::new(Jenkins::default()));
    let app = Router::new()
        .route("/me/api/json", get(whoami))
        .route("/crumbIssuer/api/json", get(crumb))
        .route("/api/json", get(jobs))
        .route("/createItem", post(create_item))
        .route("/job/{name}/api/json", get(job_info))
        .route("/job/{name}/build", post(build))
        .route("/job/{name}/{build}/consoleText", get(console))
        .route(
            "/me/descriptorByName/jenkins.security.ApiTokenProperty/generateNewToken",
            post(generate_token),
        )
        .route(
            "/me/descriptorByName/jenkins.security.ApiTokenProperty/revoke",
            post(revoke_token),
        )
        .route(
            "/credentials/store/system/domain/_/credential/{name}/doDelete",
            post(delete_credential),
        )
        .route(
            "/credentials/store/system/domain/_/createCredentials",
            post(create_credentials),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/"), state)
}

async fn connected(url: &str) -> JenkinsClient {
    let mut client = JenkinsClient::new(url, "admin", "secret", Duration::from_secs(5)).unwrap();
    assert_eq!(client.connect().await.unwrap(), "admin");
    client
}

#[tokio::test]
async fn test_job_lifecycle() {
    let (url, state) = mock_jenkins().await;
    let client = connected(&url).await;
    assert!(client.is_connected());
    assert_eq!(client.user(), Some("admin"));
    assert_eq!(client.running_builds().await.unwrap(), 2);

    client
        .create_job("netapp-ns-1", "<flow-definition/>".to_string())
        .await
        .unwrap();
    assert!(matches!(
        client.last_build_number("netapp-ns-1").await,
        Err(JenkinsError::Protocol { .. })
    ));
    assert_eq!(client.next_build_number("netapp-ns-1").await.unwrap(), 1);
    assert_eq!(client.build_job("netapp-ns-1").await.unwrap(), 1);
    assert_eq!(client.last_build_number("netapp-ns-1").await.unwrap(), 1);
    assert_eq!(client.build_job("netapp-ns-1").await.unwrap(), 2);

    let log = client.console_text("netapp-ns-1", 2).await.unwrap();
    assert!(log.contains("netapp-ns-1 #2"));

    assert!(state.lock().unwrap().jobs.contains_key("netapp-ns-1"));
}

#[tokio::test]
async fn test_bad_credentials_are_http_errors() {
    let (url, _) = mock_jenkins().await;
    let mut client = JenkinsClient::new(&url, "admin", "wrong", Duration::from_secs(5)).unwrap();
    assert!(matches!(
        client.connect().await,
        Err(JenkinsError::Http { operation: "whoami", status: 401 })
    ));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_unknown_job_is_http_404() {
    let (url, _) = mock_jenkins().await;
    let client = connected(&url).await;
    assert!(matches!(
        client.next_build_number("missing").await,
        Err(JenkinsError::Http { status: 404, .. })
    ));
}

#[tokio::test]
async fn test_credential_is_replaced() {
    let (url, state) = mock_jenkins().await;
    let client = connected(&url).await;

    client
        .create_credential("communication_token", "first", "run 1")
        .await
        .unwrap();
    client
        .create_credential("communication_token", "second", "run 2")
        .await
        .unwrap();

    let jenkins = state.lock().unwrap();
    assert_eq!(jenkins.deletes, 2);
    assert_eq!(jenkins.credentials["communication_token"], "second");
    assert!(jenkins.live_tokens.is_empty());
    assert_eq!(jenkins.revoked, vec!["0b6c", "0b6c"]);
}

#[tokio::test]
async fn test_token_is_revoked_when_the_write_fails() {
    let (url, state) = mock_jenkins().await;
    let client = connected(&url).await;
    state.lock().unwrap().reject_credentials = true;

    let err = client
        .create_credential("communication_token_2", "b", "")
        .await
        .unwrap_err();
    assert!(matches!(err, JenkinsError::Http { operation: "create credential", status: 500 }));

    let jenkins = state.lock().unwrap();
    assert!(jenkins.live_tokens.is_empty());
    assert_eq!(jenkins.revoked, vec!["0b6c"]);
    assert!(jenkins.credentials.is_empty());
}

#[tokio::test]
async fn test_job_names_are_path_encoded() {
    let (url, state) = mock_jenkins().await;
    let client = connected(&url).await;
    let name = "net app#1";

    client.create_job(name, "<flow-definition/>".to_string()).await.unwrap();
    assert_eq!(client.build_job(name).await.unwrap(), 1);
    assert_eq!(client.last_build_number(name).await.unwrap(), 1);
    assert!(client.console_text(name, 1).await.unwrap().contains("net app#1 #1"));
    assert!(state.lock().unwrap().jobs.contains_key(name));
}

#[tokio::test]
async fn test_fleet_over_registered_agents() {
    let (url, state) = mock_jenkins().await;
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("fleet.db").to_str().unwrap()).unwrap();
    store
        .upsert_testbed(&Testbed {
            id: "testbed_itav".into(),
            name: "ITAv".into(),
            description: String::new(),
        })
        .unwrap();
    let live = store.add_agent("testbed_itav", &url, "admin", "secret").unwrap();
    store
        .add_agent("testbed_itav", "http://127.0.0.1:9", "admin", "secret")
        .unwrap();

    let fleet = JenkinsFleet::new(
        store,
        &AgentsConfig {
            probe_timeout_secs: 2,
            request_timeout_secs: 5,
        },
    );
    let agents = fleet.list_agents("testbed_itav").await.unwrap();
    assert_eq!(agents.len(), 2);

    let probe = fleet.probe(&agents[0]).await;
    assert!(probe.reachable);
    assert_eq!(probe.active_jobs, 2);
    assert!(!fleet.probe(&agents[1]).await.reachable);

    let agent = fleet.agent(live).await.unwrap().unwrap();
    let job = fleet
        .submit(&agent, "vOBU-ns-3", "pipeline { echo 'a && b' }")
        .await
        .unwrap();
    assert_eq!(job, JobRef { name: "vOBU-ns-3".into() });
    assert_eq!(fleet.start(&agent, &job).await.unwrap(), 1);
    assert_eq!(fleet.last_build_number(&agent, "vOBU-ns-3").await.unwrap(), 1);
    assert!(fleet
        .fetch_log(&agent, "vOBU-ns-3", 1)
        .await
        .unwrap()
        .contains("Finished: SUCCESS"));

    let config = state.lock().unwrap().jobs["vOBU-ns-3"].0.clone();
    assert!(config.contains("flow-definition"));
    assert!(config.contains("echo &#x27;a &amp;&amp; b&#x27;") || config.contains("echo &#39;a &amp;&amp; b&#39;"));

    fleet
        .create_credential(&agent, "communication_token", "tok", "run 3")
        .await
        .unwrap();
    assert_eq!(state.lock().unwrap().credentials["communication_token"], "tok");
}

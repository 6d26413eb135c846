//! Jenkins control plane over HTTP.
//!
//! [`JenkinsClient`] is state-checked: every operation except
//! [`JenkinsClient::connect`] fails with [`JenkinsError::NotConnected`] until
//! the credentials have been verified against the server.

use std::time::Duration;

use anyhow::Context;
use askama::Template;
use reqwest::{Client, IntoUrl, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::job_config::JobConfig;
use super::{Agent, AgentDirectory, AgentProbe, BuildId, ControlPlane, JobRef};
use crate::config::AgentsConfig;
use crate::storage::SqliteStore;

const CREDENTIAL_CLASS: &str = "org.jenkinsci.plugins.plaincredentials.impl.StringCredentialsImpl";
const TOKEN_NAME: &str = "communicationToken";

#[derive(Debug, Error)]
pub enum JenkinsError {
    #[error("not connected to a Jenkins server")]
    NotConnected,

    #[error("{operation} failed with HTTP {status}")]
    Http { operation: &'static str, status: u16 },

    #[error("transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response to {operation}: {detail}")]
    Protocol { operation: &'static str, detail: String },
}

#[derive(Debug, Clone)]
enum Session {
    Disconnected,
    Connected { user: String },
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Crumb {
    crumb: String,
    #[serde(rename = "crumbRequestField")]
    field: String,
}

#[derive(Debug, Deserialize)]
struct JobsInfo {
    #[serde(default)]
    jobs: Vec<JobColor>,
}

#[derive(Debug, Deserialize)]
struct JobColor {
    #[serde(default)]
    color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildNumbers {
    #[serde(default)]
    next_build_number: Option<u64>,
    #[serde(default)]
    last_build: Option<BuildNumber>,
}

#[derive(Debug, Deserialize)]
struct BuildNumber {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct NewToken {
    data: NewTokenData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewTokenData {
    token_uuid: String,
    token_value: String,
}

/// Client for one Jenkins server.
pub struct JenkinsClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    session: Session,
}

impl JenkinsClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, JenkinsError> {
        let http = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()
            .map_err(|source| JenkinsError::Transport {
                operation: "client setup",
                source,
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            session: Session::Disconnected,
        })
    }

    pub fn for_agent(agent: &Agent, timeout: Duration) -> Result<Self, JenkinsError> {
        Self::new(&agent.url, &agent.username, &agent.password, timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Base URL extended by `segments`, each percent-encoded as one path
    /// segment.
    fn segments_url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, JenkinsError> {
        let invalid = |detail: String| JenkinsError::Protocol {
            operation: "build url",
            detail,
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| invalid(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn job_url(&self, job: &str, rest: &[&str]) -> Result<Url, JenkinsError> {
        self.segments_url(["job", job].into_iter().chain(rest.iter().copied()))
    }

    fn credential_url(&self, name: &str, action: &str) -> Result<Url, JenkinsError> {
        self.segments_url([
            "credentials",
            "store",
            "system",
            "domain",
            "_",
            "credential",
            name,
            action,
        ])
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Response, JenkinsError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|source| JenkinsError::Transport { operation, source })?;
        if !response.status().is_success() {
            return Err(JenkinsError::Http {
                operation,
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn json<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        response: Response,
    ) -> Result<T, JenkinsError> {
        response.json().await.map_err(|e| JenkinsError::Protocol {
            operation,
            detail: e.to_string(),
        })
    }

    fn ensure_connected(&self) -> Result<(), JenkinsError> {
        match self.session {
            Session::Connected { .. } => Ok(()),
            Session::Disconnected => Err(JenkinsError::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.session, Session::Connected { .. })
    }

    /// Verify the credentials. Returns the authenticated user id.
    pub async fn connect(&mut self) -> Result<String, JenkinsError> {
        let response = self.send("whoami", self.http.get(self.url("/me/api/json"))).await?;
        let who: WhoAmI = Self::json("whoami", response).await?;
        debug!(url = %self.base_url, user = %who.id, "connected to Jenkins");
        self.session = Session::Connected { user: who.id.clone() };
        Ok(who.id)
    }

    pub fn user(&self) -> Option<&str> {
        match &self.session {
            Session::Connected { user } => Some(user),
            Session::Disconnected => None,
        }
    }

    /// CSRF crumb header, `None` when the server has CSRF protection off.
    async fn crumb(&self) -> Result<Option<(String, String)>, JenkinsError> {
        let response = self
            .http
            .get(self.url("/crumbIssuer/api/json"))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|source| JenkinsError::Transport {
                operation: "crumb",
                source,
            })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(JenkinsError::Http {
                operation: "crumb",
                status: response.status().as_u16(),
            });
        }
        let crumb: Crumb = Self::json("crumb", response).await?;
        Ok(Some((crumb.field, crumb.crumb)))
    }

    async fn post(&self, url: impl IntoUrl) -> Result<RequestBuilder, JenkinsError> {
        let mut request = self.http.post(url);
        if let Some((field, value)) = self.crumb().await? {
            request = request.header(field, value);
        }
        Ok(request)
    }

    /// Number of builds in progress, from the animated job colors.
    pub async fn running_builds(&self) -> Result<usize, JenkinsError> {
        self.ensure_connected()?;
        let response = self
            .send("list jobs", self.http.get(self.url("/api/json?tree=jobs[color]")))
            .await?;
        let info: JobsInfo = Self::json("list jobs", response).await?;
        Ok(info
            .jobs
            .iter()
            .filter(|j| j.color.as_deref().is_some_and(|c| c.ends_with("_anime")))
            .count())
    }

    pub async fn create_job(&self, name: &str, config_xml: String) -> Result<(), JenkinsError> {
        self.ensure_connected()?;
        let request = self
            .post(self.url("/createItem"))
            .await?
            .query(&[("name", name)])
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(config_xml);
        self.send("create job", request).await?;
        info!(url = %self.base_url, job = %name, "created job");
        Ok(())
    }

    async fn build_numbers(&self, name: &str) -> Result<BuildNumbers, JenkinsError> {
        let response = self
            .send(
                "job info",
                self.http
                    .get(self.job_url(name, &["api", "json"])?)
                    .query(&[("tree", "nextBuildNumber,lastBuild[number]")]),
            )
            .await?;
        Self::json("job info", response).await
    }

    pub async fn next_build_number(&self, name: &str) -> Result<BuildId, JenkinsError> {
        self.ensure_connected()?;
        self.build_numbers(name)
            .await?
            .next_build_number
            .ok_or_else(|| JenkinsError::Protocol {
                operation: "job info",
                detail: "missing nextBuildNumber".to_string(),
            })
    }

    pub async fn last_build_number(&self, name: &str) -> Result<BuildId, JenkinsError> {
        self.ensure_connected()?;
        self.build_numbers(name)
            .await?
            .last_build
            .map(|b| b.number)
            .ok_or_else(|| JenkinsError::Protocol {
                operation: "job info",
                detail: format!("job {name} has no builds"),
            })
    }

    /// Queue a build. Returns the number the build will get.
    pub async fn build_job(&self, name: &str) -> Result<BuildId, JenkinsError> {
        let number = self.next_build_number(name).await?;
        let request = self.post(self.job_url(name, &["build"])?).await?;
        self.send("build job", request).await?;
        info!(url = %self.base_url, job = %name, build = number, "queued build");
        Ok(number)
    }

    pub async fn console_text(&self, name: &str, build: BuildId) -> Result<String, JenkinsError> {
        self.ensure_connected()?;
        let build = build.to_string();
        let response = self
            .send(
                "console text",
                self.http.get(self.job_url(name, &[build.as_str(), "consoleText"])?),
            )
            .await?;
        response.text().await.map_err(|e| JenkinsError::Protocol {
            operation: "console text",
            detail: e.to_string(),
        })
    }

    /// Replace the global secret-text credential `name` with `value`.
    ///
    /// Credential writes are authenticated with a freshly generated API
    /// token, which is revoked again once the writes are done.
    pub async fn create_credential(
        &self,
        name: &str,
        value: &str,
        description: &str,
    ) -> Result<(), JenkinsError> {
        self.ensure_connected()?;
        let crumb = self.crumb().await?;
        let with_crumb = |mut request: RequestBuilder| {
            if let Some((field, value)) = &crumb {
                request = request.header(field.as_str(), value.as_str());
            }
            request
        };

        let response = self
            .send(
                "generate token",
                with_crumb(self.http.post(self.url(
                    "/me/descriptorByName/jenkins.security.ApiTokenProperty/generateNewToken",
                )))
                .form(&[("newTokenName", TOKEN_NAME)]),
            )
            .await?;
        let token: NewToken = Self::json("generate token", response).await?;
        let token = token.data;

        let written: Result<(), JenkinsError> = async {
            let deleted = with_crumb(self.http.post(self.credential_url(name, "doDelete")?))
                .basic_auth(&self.username, Some(&token.token_value))
                .send()
                .await
                .map_err(|source| JenkinsError::Transport {
                    operation: "delete credential",
                    source,
                })?;
            let status = deleted.status();
            if !status.is_success() && status != StatusCode::NOT_FOUND {
                return Err(JenkinsError::Http {
                    operation: "delete credential",
                    status: status.as_u16(),
                });
            }

            let payload = serde_json::json!({
                "": "0",
                "credentials": {
                    "scope": "GLOBAL",
                    "id": name,
                    "secret": value,
                    "description": description,
                    "$class": CREDENTIAL_CLASS,
                }
            });
            let created = with_crumb(
                self.http
                    .post(self.url("/credentials/store/system/domain/_/createCredentials")),
            )
            .basic_auth(&self.username, Some(&token.token_value))
            .form(&[("json", payload.to_string())])
            .send()
            .await
            .map_err(|source| JenkinsError::Transport {
                operation: "create credential",
                source,
            })?;
            if !created.status().is_success() {
                return Err(JenkinsError::Http {
                    operation: "create credential",
                    status: created.status().as_u16(),
                });
            }
            Ok(())
        }
        .await;

        let revoked = self
            .send(
                "revoke token",
                with_crumb(self.http.post(self.url(
                    "/me/descriptorByName/jenkins.security.ApiTokenProperty/revoke",
                )))
                .form(&[("tokenUuid", token.token_uuid.as_str())]),
            )
            .await;
        if let Err(e) = &revoked {
            warn!(url = %self.base_url, error = %e, "failed to revoke the credential API token");
        }

        written?;
        revoked?;
        info!(url = %self.base_url, credential = %name, "created credential");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fleet
// ---------------------------------------------------------------------------

/// All registered Jenkins agents, backed by the agent registry.
#[derive(Clone)]
pub struct JenkinsFleet {
    store: SqliteStore,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl JenkinsFleet {
    pub fn new(store: SqliteStore, config: &AgentsConfig) -> Self {
        Self {
            store,
            probe_timeout: config.probe_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    async fn connected(&self, agent: &Agent, timeout: Duration) -> Result<JenkinsClient, JenkinsError> {
        let mut client = JenkinsClient::for_agent(agent, timeout)?;
        client.connect().await?;
        Ok(client)
    }
}

#[async_trait::async_trait]
impl AgentDirectory for JenkinsFleet {
    async fn list_agents(&self, testbed_id: &str) -> anyhow::Result<Vec<Agent>> {
        self.store.agents_for_testbed(testbed_id)
    }

    async fn agent(&self, id: i64) -> anyhow::Result<Option<Agent>> {
        self.store.get_agent(id)
    }

    async fn probe(&self, agent: &Agent) -> AgentProbe {
        let result: Result<usize, JenkinsError> = async {
            let client = self.connected(agent, self.probe_timeout).await?;
            client.running_builds().await
        }
        .await;

        match result {
            Ok(active_jobs) => AgentProbe {
                reachable: true,
                active_jobs,
            },
            Err(e) => {
                warn!(agent_id = agent.id, url = %agent.url, error = %e, "agent probe failed");
                AgentProbe::unreachable()
            }
        }
    }
}

#[async_trait::async_trait]
impl ControlPlane for JenkinsFleet {
    async fn submit(&self, agent: &Agent, job_name: &str, script: &str) -> anyhow::Result<JobRef> {
        let description = format!("CI/CD manager test run {job_name}");
        let config_xml = JobConfig::new(&description, script)
            .render()
            .context("failed to render job definition")?;
        let client = self.connected(agent, self.request_timeout).await?;
        client.create_job(job_name, config_xml).await?;
        Ok(JobRef {
            name: job_name.to_string(),
        })
    }

    async fn start(&self, agent: &Agent, job: &JobRef) -> anyhow::Result<BuildId> {
        let client = self.connected(agent, self.request_timeout).await?;
        Ok(client.build_job(&job.name).await?)
    }

    async fn last_build_number(&self, agent: &Agent, job_name: &str) -> anyhow::Result<BuildId> {
        let client = self.connected(agent, self.request_timeout).await?;
        Ok(client.last_build_number(job_name).await?)
    }

    async fn fetch_log(&self, agent: &Agent, job_name: &str, build: BuildId) -> anyhow::Result<String> {
        let client = self.connected(agent, self.request_timeout).await?;
        Ok(client.console_text(job_name, build).await?)
    }

    async fn create_credential(
        &self,
        agent: &Agent,
        name: &str,
        value: &str,
        description: &str,
    ) -> anyhow::Result<()> {
        let client = self.connected(agent, self.request_timeout).await?;
        Ok(client.create_credential(name, value, description).await?)
    }
}

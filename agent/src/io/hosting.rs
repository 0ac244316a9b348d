//! Code-hosting adapter: pull request creation and auto-merge.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use crate::io::config::{GitHubConfig, MergeMethod};
use crate::io::prompt::head_bytes;

const USER_AGENT: &str = "patch-agent";
const API_VERSION: &str = "2022-11-28";
const MAX_ERROR_BODY_LEN: usize = 500;

const ENABLE_AUTO_MERGE_MUTATION: &str = "mutation($id: ID!, $method: PullRequestMergeMethod!) { \
     enablePullRequestAutoMerge(input: {pullRequestId: $id, mergeMethod: $method}) { \
     pullRequest { number } } }";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRequest {
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(rename = "html_url")]
    pub url: String,
    /// GraphQL node id, needed for auto-merge.
    pub node_id: String,
}

/// Pull-request operations of the hosting service.
pub trait CodeHost {
    fn open_pull_request(&self, request: &PullRequestRequest) -> Result<PullRequest>;
    fn enable_auto_merge(&self, pr: &PullRequest, method: MergeMethod) -> Result<()>;
}

/// GitHub REST (pull requests) and GraphQL (auto-merge) client.
pub struct GitHubHost {
    client: Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
}

#[derive(Serialize)]
struct CreatePrRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

#[derive(Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

impl GitHubHost {
    pub fn new(config: &GitHubConfig, token: impl Into<String>) -> Result<Self> {
        if config.owner.trim().is_empty() || config.repo.trim().is_empty() {
            return Err(anyhow!(
                "github.owner and github.repo must be set (or GITHUB_OWNER/GITHUB_REPO)"
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("build GitHub HTTP client")?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            token: token.into(),
        })
    }

    /// Build a host with the token from `GITHUB_TOKEN`.
    pub fn from_env(config: &GitHubConfig) -> Result<Self> {
        let token = env::var("GITHUB_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("GITHUB_TOKEN is not set"))?;
        Self::new(config, token)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }
}

impl CodeHost for GitHubHost {
    #[instrument(skip_all, fields(branch = %request.branch, base = %request.base))]
    fn open_pull_request(&self, request: &PullRequestRequest) -> Result<PullRequest> {
        let url = format!("{}/repos/{}/{}/pulls", self.api_url, self.owner, self.repo);
        let body = CreatePrRequest {
            title: &request.title,
            body: &request.body,
            head: &request.branch,
            base: &request.base,
        };
        let resp = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .context("send pull request creation request")?;
        let status = resp.status();
        let text = resp.text().context("read pull request response")?;
        let pr = decode_pull_request(status, &text)?;
        info!(number = pr.number, url = %pr.url, "opened pull request");
        Ok(pr)
    }

    #[instrument(skip_all, fields(number = pr.number, method = method.graphql_name()))]
    fn enable_auto_merge(&self, pr: &PullRequest, method: MergeMethod) -> Result<()> {
        let url = format!("{}/graphql", self.api_url);
        let body = json!({
            "query": ENABLE_AUTO_MERGE_MUTATION,
            "variables": { "id": pr.node_id, "method": method.graphql_name() },
        });
        let resp = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .context("send auto-merge request")?;
        let status = resp.status();
        let text = resp.text().context("read auto-merge response")?;
        decode_graphql(status, &text)?;
        info!(url = %pr.url, "auto-merge enabled");
        Ok(())
    }
}

fn decode_pull_request(status: StatusCode, body: &str) -> Result<PullRequest> {
    if !status.is_success() {
        return Err(api_error(status, body));
    }
    serde_json::from_str(body).context("parse pull request response")
}

fn decode_graphql(status: StatusCode, body: &str) -> Result<()> {
    if !status.is_success() {
        return Err(api_error(status, body));
    }
    let parsed: GraphQlResponse = serde_json::from_str(body).context("parse GraphQL response")?;
    if !parsed.errors.is_empty() {
        let messages: Vec<&str> = parsed.errors.iter().map(|e| e.message.as_str()).collect();
        return Err(anyhow!("GitHub GraphQL error: {}", messages.join("; ")));
    }
    Ok(())
}

fn api_error(status: StatusCode, body: &str) -> anyhow::Error {
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(body) {
        let detail = api_error
            .errors
            .first()
            .and_then(|e| e.message.clone())
            .unwrap_or_default();
        return if detail.is_empty() {
            anyhow!("GitHub API error ({status}): {}", api_error.message)
        } else {
            anyhow!("GitHub API error ({status}): {}: {detail}", api_error.message)
        };
    }
    anyhow!(
        "GitHub API error ({status}): {}",
        head_bytes(body.trim(), MAX_ERROR_BODY_LEN)
    )
}

//! GitHub issues adapter for the [`IssueTracker`] contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::http::{build_client, ensure_success, json_body};
use super::{ConnectorError, ExternalIssue, IssueQuery, IssueTracker, NewIssue, TrackerIssue};
use crate::config::TrackerConfig;

const ACCEPT: &str = "application/vnd.github.v3+json";
/// Search hits inspected when resolving a marker
const MARKER_SEARCH_PAGE: &str = "10";

#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    html_url: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
}

impl GitHubIssue {
    /// Whether the body embeds `marker` as its own HTML comment. Search is
    /// fuzzy, so `c/r` must not match an issue carrying `c/r-2`.
    fn carries_marker(&self, marker: &str) -> bool {
        let comment = format!("<!-- {} -->", marker);
        self.body
            .as_deref()
            .is_some_and(|body| body.contains(&comment))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<GitHubIssue>,
}

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

#[derive(Clone)]
pub struct GitHubTracker {
    client: Client,
    api_base: String,
    token: String,
    owner: String,
    repo: String,
}

impl GitHubTracker {
    pub fn new(config: &TrackerConfig) -> Result<Self, ConnectorError> {
        let missing = |what: &str| ConnectorError::ConfigurationError {
            details: format!("GitHub {} is not configured", what),
        };
        let token = config.token.clone().ok_or_else(|| missing("token"))?;
        let owner = config.owner.clone().ok_or_else(|| missing("owner"))?;
        let repo = config.repo.clone().ok_or_else(|| missing("repository"))?;
        Url::parse(&config.api_base).map_err(|err| ConnectorError::ConfigurationError {
            details: format!("invalid GitHub API base {}: {}", config.api_base, err),
        })?;

        Ok(Self {
            client: build_client(config.timeout())?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token,
            owner,
            repo,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("Accept", ACCEPT)
    }

    fn repo_path(&self) -> String {
        format!("/repos/{}/{}", self.owner, self.repo)
    }

    /// Labels that exist on the repository. Empty when they cannot be read,
    /// in which case issues are created without labels.
    pub async fn repository_labels(&self) -> Vec<String> {
        let response = self
            .request(Method::GET, &format!("{}/labels", self.repo_path()))
            .query(&[("per_page", "100")])
            .send()
            .await;
        let labels: Result<Vec<GitHubLabel>, ConnectorError> = match response {
            Ok(response) => match ensure_success(response).await {
                Ok(response) => json_body(response).await,
                Err(err) => Err(err),
            },
            Err(err) => Err(err.into()),
        };
        match labels {
            Ok(labels) => labels.into_iter().map(|label| label.name).collect(),
            Err(err) => {
                warn!(error = %err, "Failed to read repository labels");
                Vec::new()
            }
        }
    }

    fn reference(&self, issue: GitHubIssue) -> ExternalIssue {
        ExternalIssue {
            id: issue.number.to_string(),
            url: issue.html_url,
        }
    }
}

#[async_trait]
impl IssueTracker for GitHubTracker {
    async fn create_issue(&self, issue: &NewIssue) -> Result<ExternalIssue, ConnectorError> {
        let known = self.repository_labels().await;
        let (labels, unknown): (Vec<&String>, Vec<&String>) =
            issue.labels.iter().partition(|label| known.contains(*label));
        if !unknown.is_empty() {
            warn!(?unknown, "Labels missing on repository will be ignored");
        }

        let mut payload = json!({
            "title": issue.title,
            "body": issue.body,
            "labels": labels,
        });
        if let Some(assignee) = &issue.assignee {
            payload["assignees"] = json!([assignee]);
        }

        let response = self
            .request(Method::POST, &format!("{}/issues", self.repo_path()))
            .json(&payload)
            .send()
            .await?;
        let created: GitHubIssue = json_body(ensure_success(response).await?).await?;
        info!(number = created.number, "Created GitHub issue");
        Ok(self.reference(created))
    }

    async fn update_issue(&self, external_id: &str, body: &str) -> Result<(), ConnectorError> {
        let response = self
            .request(
                Method::PATCH,
                &format!("{}/issues/{}", self.repo_path(), external_id),
            )
            .json(&json!({ "body": body }))
            .send()
            .await?;
        ensure_success(response).await?;
        debug!(number = %external_id, "Updated GitHub issue body");
        Ok(())
    }

    async fn find_issue_by_marker(
        &self,
        marker: &str,
    ) -> Result<Option<ExternalIssue>, ConnectorError> {
        let query = format!(
            "\"{}\" repo:{}/{} in:body type:issue",
            marker, self.owner, self.repo
        );
        let response = self
            .request(Method::GET, "/search/issues")
            .query(&[("q", query.as_str()), ("per_page", MARKER_SEARCH_PAGE)])
            .send()
            .await?;
        let found: SearchResponse = json_body(ensure_success(response).await?).await?;
        let hits = found.items.len();
        let matched = found
            .items
            .into_iter()
            .find(|issue| issue.carries_marker(marker));
        if matched.is_none() && hits > 0 {
            debug!(hits, marker, "Marker search returned only near misses");
        }
        Ok(matched.map(|issue| self.reference(issue)))
    }

    async fn search_issues(
        &self,
        query: &IssueQuery,
    ) -> Result<Vec<TrackerIssue>, ConnectorError> {
        if query.keywords.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }
        let terms = query
            .keywords
            .iter()
            .map(|keyword| format!("\"{}\"", keyword.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");
        let mut q = format!("repo:{}/{} is:issue", self.owner, self.repo);
        if let Some(after) = query.created_after {
            q.push_str(&format!(" created:>{}", after.format("%Y-%m-%d")));
        }
        q.push(' ');
        q.push_str(&terms);

        let per_page = query.limit.min(100).to_string();
        let response = self
            .request(Method::GET, "/search/issues")
            .query(&[
                ("q", q.as_str()),
                ("sort", "updated"),
                ("order", "desc"),
                ("per_page", per_page.as_str()),
            ])
            .send()
            .await?;
        let found: SearchResponse = json_body(ensure_success(response).await?).await?;
        debug!(hits = found.items.len(), "Searched GitHub issues");

        Ok(found
            .items
            .into_iter()
            .map(|issue| TrackerIssue {
                id: issue.number.to_string(),
                open: issue.state.as_deref() != Some("closed"),
                title: issue.title,
                url: issue.html_url,
                created_at: issue.created_at,
                closed_at: issue.closed_at,
                body: issue.body.unwrap_or_default(),
                labels: issue.labels.into_iter().map(|label| label.name).collect(),
            })
            .collect())
    }
}

//! Collaborator trait definitions
//!
//! The pipeline only talks to the outside world through these traits. Each
//! concrete adapter in this module tree implements one of them; tests swap in
//! in-process fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{MonitoringEvent, TimeWindow};

/// Connector-specific error types for structured error handling
#[derive(Debug, Clone)]
pub enum ConnectorError {
    /// HTTP error from upstream service
    HttpError { status: u16, body: Option<String> },
    /// Malformed response from upstream service
    MalformedResponse {
        details: String,
        partial_data: Option<String>,
    },
    /// Network or connectivity error
    NetworkError { details: String, retryable: bool },
    /// Authentication/authorization error
    AuthenticationError { details: String },
    /// Rate limiting error
    RateLimitError { retry_after: Option<u64> },
    /// Call did not complete inside its budget
    Timeout { operation: String, after_ms: u64 },
    /// Configuration or setup error
    ConfigurationError { details: String },
}

impl ConnectorError {
    /// Whether a single retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::HttpError { status, .. } => *status >= 500 || *status == 429,
            ConnectorError::NetworkError { retryable, .. } => *retryable,
            ConnectorError::RateLimitError { .. } | ConnectorError::Timeout { .. } => true,
            ConnectorError::MalformedResponse { .. }
            | ConnectorError::AuthenticationError { .. }
            | ConnectorError::ConfigurationError { .. } => false,
        }
    }

    /// Map a failed response status to the matching error variant.
    pub fn from_status(status: u16, body: Option<String>, retry_after: Option<u64>) -> Self {
        match status {
            401 | 403 => ConnectorError::AuthenticationError {
                details: body.unwrap_or_else(|| format!("upstream returned {}", status)),
            },
            429 => ConnectorError::RateLimitError { retry_after },
            _ => ConnectorError::HttpError { status, body },
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return ConnectorError::MalformedResponse {
                details: error.to_string(),
                partial_data: None,
            };
        }
        ConnectorError::NetworkError {
            details: error.to_string(),
            retryable: error.is_timeout() || error.is_connect() || error.is_request(),
        }
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::HttpError { status, body } => {
                write!(
                    f,
                    "HTTP error {}: {}",
                    status,
                    body.as_deref().unwrap_or("No body")
                )
            }
            ConnectorError::MalformedResponse { details, .. } => {
                write!(f, "Malformed response: {}", details)
            }
            ConnectorError::NetworkError { details, .. } => {
                write!(f, "Network error: {}", details)
            }
            ConnectorError::AuthenticationError { details } => {
                write!(f, "Authentication error: {}", details)
            }
            ConnectorError::RateLimitError { retry_after } => {
                write!(f, "Rate limit exceeded")?;
                if let Some(after) = retry_after {
                    write!(f, " (retry after: {}s)", after)?;
                }
                Ok(())
            }
            ConnectorError::Timeout {
                operation,
                after_ms,
            } => {
                write!(f, "{} timed out after {}ms", operation, after_ms)
            }
            ConnectorError::ConfigurationError { details } => {
                write!(f, "Configuration error: {}", details)
            }
        }
    }
}

impl std::error::Error for ConnectorError {}

/// Prompt handed to the language model.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
}

/// Named JSON schema the model output is expected to follow.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: &'static str,
    pub schema: Value,
}

/// Language model transport: given text, return text that should contain JSON
#[async_trait]
pub trait LlmCapability: Send + Sync {
    async fn invoke(
        &self,
        prompt: &LlmPrompt,
        schema: &OutputSchema,
    ) -> Result<String, ConnectorError>;

    /// Identifier recorded on every candidate produced with this model.
    fn model_id(&self) -> String;
}

/// Issue to open on the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
}

/// Reference to an issue that exists on the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIssue {
    pub id: String,
    pub url: Option<String>,
}

/// Keyword search over the tracker's issues.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueQuery {
    /// Terms joined with OR; an empty list matches nothing
    pub keywords: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Issue returned by a tracker search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub open: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub body: String,
    pub labels: Vec<String>,
}

/// Issue tracker contract
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, issue: &NewIssue) -> Result<ExternalIssue, ConnectorError>;

    async fn update_issue(&self, external_id: &str, body: &str) -> Result<(), ConnectorError>;

    /// Look up an issue whose body carries `marker`.
    async fn find_issue_by_marker(
        &self,
        marker: &str,
    ) -> Result<Option<ExternalIssue>, ConnectorError>;

    /// Issues matching any of the query keywords, most recently updated first.
    async fn search_issues(&self, query: &IssueQuery)
    -> Result<Vec<TrackerIssue>, ConnectorError>;
}

/// Error-monitoring query contract
#[async_trait]
pub trait ErrorMonitor: Send + Sync {
    async fn query_events(
        &self,
        window: &TimeWindow,
        service_hint: Option<&str>,
    ) -> Result<Vec<MonitoringEvent>, ConnectorError>;
}

/// Posts text back into a chat thread.
#[async_trait]
pub trait ChatReplier: Send + Sync {
    async fn reply(
        &self,
        channel_id: &str,
        root_message_id: &str,
        text: &str,
    ) -> Result<(), ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ConnectorError::HttpError { status: 503, body: None }.is_transient());
        assert!(ConnectorError::from_status(429, None, Some(3)).is_transient());
        assert!(
            ConnectorError::Timeout {
                operation: "llm".into(),
                after_ms: 10
            }
            .is_transient()
        );
        assert!(!ConnectorError::HttpError { status: 422, body: None }.is_transient());
        assert!(!ConnectorError::from_status(401, None, None).is_transient());
    }

    #[test]
    fn test_display_formats() {
        let err = ConnectorError::RateLimitError {
            retry_after: Some(30),
        };
        assert_eq!(err.to_string(), "Rate limit exceeded (retry after: 30s)");

        let err = ConnectorError::HttpError {
            status: 500,
            body: None,
        };
        assert_eq!(err.to_string(), "HTTP error 500: No body");
    }
}

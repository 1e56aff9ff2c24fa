//! Collaborator contracts and the HTTP adapters implementing them
//!
//! - `trait_`: the traits the pipeline depends on plus [`ConnectorError`]
//! - `retry`: bounded retry with timeout for outbound calls
//! - `github`, `sentry`, `llm`, `mattermost`: concrete adapters

pub mod github;
mod http;
pub mod llm;
pub mod mattermost;
pub mod retry;
pub mod sentry;
pub mod trait_;

pub use github::GitHubTracker;
pub use llm::HttpLlm;
pub use mattermost::{ChatWebhookPayload, MattermostReplier};
pub use retry::RetryPolicy;
pub use sentry::SentryMonitor;
pub use trait_::{
    ChatReplier, ConnectorError, ErrorMonitor, ExternalIssue, IssueQuery, IssueTracker,
    LlmCapability, LlmPrompt, NewIssue, OutputSchema, TrackerIssue,
};

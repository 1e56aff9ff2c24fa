//! Issue candidate produced by one extraction cycle

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Bug,
    Feature,
    Enhancement,
    Documentation,
    Question,
    Task,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Enhancement => "enhancement",
            IssueType::Documentation => "documentation",
            IssueType::Question => "question",
            IssueType::Task => "task",
        }
    }

    /// Labels every issue of this type carries.
    pub fn default_labels(&self) -> &'static [&'static str] {
        match self {
            IssueType::Bug => &["bug"],
            IssueType::Feature => &["enhancement", "feature"],
            IssueType::Enhancement => &["enhancement"],
            IssueType::Documentation => &["documentation"],
            IssueType::Question => &["question"],
            IssueType::Task => &["task"],
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bug" => Some(IssueType::Bug),
            "feature" | "feature_request" => Some(IssueType::Feature),
            "enhancement" | "improvement" => Some(IssueType::Enhancement),
            "documentation" | "docs" => Some(IssueType::Documentation),
            "question" => Some(IssueType::Question),
            "task" => Some(IssueType::Task),
            _ => None,
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" | "minor" => Some(Severity::Low),
            "medium" | "normal" => Some(Severity::Medium),
            "high" | "major" => Some(Severity::High),
            "critical" | "blocker" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured fields extracted from a conversation.
///
/// This is also the shape persisted on the issue record, so the decision gate
/// can diff a fresh extraction against what was last pushed to the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFields {
    pub title: String,
    pub description: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps_to_reproduce: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_behavior: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_behavior: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Error-monitoring event attached to a candidate as supplementary context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringEvent {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
}

/// Existing tracker issue that looks like the same problem as a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarIssue {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub open: bool,
    /// Term similarity to the candidate, in [0, 1]
    pub similarity: f32,
}

/// Closed time interval used to correlate monitoring events with a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// True when the event was active at any point inside the window.
    pub fn overlaps(&self, first_seen: DateTime<Utc>, last_seen: DateTime<Utc>) -> bool {
        first_seen <= self.end && last_seen >= self.start
    }
}

/// Output of a successful extraction. Lives for one trigger cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueCandidate {
    pub thread: ThreadId,
    pub fields: CandidateFields,
    pub classifier_confidence: f32,
    pub completeness: f32,
    /// `w * classifier_confidence + (1 - w) * completeness`
    pub confidence: f32,
    pub low_confidence: bool,
    pub model: String,
    pub extracted_at: DateTime<Utc>,
    pub related_events: Vec<MonitoringEvent>,
    /// Other tracker issues that may already cover this problem
    pub similar_issues: Vec<SimilarIssue>,
}

impl IssueCandidate {
    pub fn title(&self) -> &str {
        &self.fields.title
    }

    /// Service or component the conversation is about, if the model named one.
    pub fn service_hint(&self) -> Option<&str> {
        self.fields
            .service
            .as_deref()
            .or(self.fields.component.as_deref())
            .filter(|hint| !hint.trim().is_empty())
    }
}

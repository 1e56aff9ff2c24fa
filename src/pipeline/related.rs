//! Best-effort search for existing tracker issues similar to a new candidate.
//!
//! Keywords come from the candidate's title, component and service. Hits are
//! scored by term similarity and kept only above a bar that rises for closed
//! and long-closed issues. Like enrichment, failures leave the candidate as is.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use tracing::{debug, warn};

use crate::connectors::{IssueQuery, IssueTracker, TrackerIssue};
use crate::models::{IssueCandidate, SimilarIssue};
use crate::pipeline::similarity::{terms, text_similarity};

const MAX_KEYWORDS: usize = 5;
const MIN_KEYWORD_CHARS: usize = 3;
/// Search hits scored per candidate
const SEARCH_LIMIT: usize = 10;
/// Issue bodies are compared up to this many characters
const BODY_CHARS: usize = 2_000;

const OPEN_THRESHOLD: f32 = 0.4;
const RECENTLY_CLOSED_THRESHOLD: f32 = 0.6;
const CLOSED_THRESHOLD: f32 = 0.7;
const RECENTLY_CLOSED_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelatedIssueConfig {
    pub timeout: Duration,
    pub lookback_days: u32,
    pub max_results: usize,
}

pub struct RelatedIssueFinder {
    tracker: Arc<dyn IssueTracker>,
    config: RelatedIssueConfig,
}

impl RelatedIssueFinder {
    pub fn new(tracker: Arc<dyn IssueTracker>, config: RelatedIssueConfig) -> Self {
        Self { tracker, config }
    }

    /// Attach similar tracker issues to `candidate`, best first.
    pub async fn attach(&self, mut candidate: IssueCandidate) -> IssueCandidate {
        let keywords = search_keywords(&candidate);
        if keywords.is_empty() || self.config.max_results == 0 {
            return candidate;
        }

        let query = IssueQuery {
            keywords,
            created_after: Some(
                Utc::now() - ChronoDuration::days(i64::from(self.config.lookback_days)),
            ),
            limit: SEARCH_LIMIT,
        };
        let search = self.tracker.search_issues(&query);
        let hits = match tokio::time::timeout(self.config.timeout, search).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(err)) => {
                warn!(thread = %candidate.thread, error = %err, "Related issue search failed");
                counter!("threadwatch_related_search_total", "outcome" => "error").increment(1);
                return candidate;
            }
            Err(_) => {
                warn!(
                    thread = %candidate.thread,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Related issue search timed out"
                );
                counter!("threadwatch_related_search_total", "outcome" => "timeout").increment(1);
                return candidate;
            }
        };

        let own_marker = format!("<!-- {} -->", candidate.thread.marker());
        let subject = format!("{}\n{}", candidate.fields.title, candidate.fields.description);
        let now = Utc::now();

        let mut similar: Vec<SimilarIssue> = hits
            .into_iter()
            .filter(|issue| !issue.body.contains(&own_marker))
            .filter_map(|issue| {
                let body: String = issue.body.chars().take(BODY_CHARS).collect();
                let text = format!("{}\n{}", issue.title, body);
                let score = text_similarity(Some(subject.as_str()), Some(text.as_str()))
                    .unwrap_or(0.0);
                (score >= threshold_for(&issue, now)).then(|| SimilarIssue {
                    id: issue.id,
                    title: issue.title,
                    url: issue.url,
                    open: issue.open,
                    similarity: score,
                })
            })
            .collect();
        similar.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        similar.truncate(self.config.max_results);

        debug!(
            thread = %candidate.thread,
            similar = similar.len(),
            "Searched for related issues"
        );
        counter!("threadwatch_related_search_total", "outcome" => "ok").increment(1);
        candidate.similar_issues = similar;
        candidate
    }
}

/// Up to five specific terms from the title, component and service. Words
/// that appear in nearly every report are left out.
pub fn search_keywords(candidate: &IssueCandidate) -> Vec<String> {
    let fields = &candidate.fields;
    let sources = [
        Some(fields.title.as_str()),
        fields.component.as_deref(),
        fields.service.as_deref(),
    ];

    let mut seen = HashSet::new();
    sources
        .into_iter()
        .flatten()
        .flat_map(terms)
        .filter(|term| term.chars().count() >= MIN_KEYWORD_CHARS && !is_generic(term))
        .filter(|term| seen.insert(term.clone()))
        .take(MAX_KEYWORDS)
        .collect()
}

fn is_generic(term: &str) -> bool {
    matches!(
        term,
        "error" | "issue" | "problem" | "bug" | "fail" | "broken" | "not" | "doesn" | "work"
    )
}

/// Similarity an issue needs to be listed. Closed issues need more, and
/// issues closed more than a month ago more still.
fn threshold_for(issue: &TrackerIssue, now: DateTime<Utc>) -> f32 {
    if issue.open {
        return OPEN_THRESHOLD;
    }
    let closed = issue.closed_at.or(issue.created_at);
    match closed {
        Some(closed) if now - closed <= ChronoDuration::days(RECENTLY_CLOSED_DAYS) => {
            RECENTLY_CLOSED_THRESHOLD
        }
        _ => CLOSED_THRESHOLD,
    }
}

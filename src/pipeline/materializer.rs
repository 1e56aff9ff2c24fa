//! Turns an accepted decision into tracker calls and an issue record.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, warn};

use crate::connectors::{IssueTracker, NewIssue, RetryPolicy};
use crate::error::{PipelineError, RepositoryError};
use crate::models::{IssueCandidate, IssueRecord, ThreadId, ThreadSnapshot};
use crate::pipeline::similarity::content_hash;
use crate::repositories::{IssueRecordStore, NewIssueRecord};

/// Applied to every created issue on top of the candidate's own labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerDefaults {
    pub labels: Vec<String>,
    pub assignee: Option<String>,
}

/// Tracker write a decision asks for. Only `Create` and `Update` decisions
/// have one, see [`Decision::materialization`](crate::pipeline::Decision::materialization).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Materialization<'a> {
    Create,
    Update(&'a IssueRecord),
}

impl Materialization<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            Materialization::Create => "create",
            Materialization::Update(_) => "update",
        }
    }
}

pub struct IssueMaterializer {
    tracker: Arc<dyn IssueTracker>,
    store: Arc<dyn IssueRecordStore>,
    defaults: TrackerDefaults,
    retry: RetryPolicy,
    permalink_base: Option<String>,
}

impl IssueMaterializer {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        store: Arc<dyn IssueRecordStore>,
        defaults: TrackerDefaults,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tracker,
            store,
            defaults,
            retry,
            permalink_base: None,
        }
    }

    /// Link issue bodies back to the chat thread as `{base}/{root_message_id}`.
    pub fn with_permalink_base(mut self, base: Option<String>) -> Self {
        self.permalink_base = base.map(|base| base.trim_end_matches('/').to_string());
        self
    }

    fn thread_permalink(&self, thread: &ThreadId) -> Option<String> {
        self.permalink_base
            .as_ref()
            .map(|base| format!("{}/{}", base, thread.root_message_id))
    }

    pub async fn current_record(&self, thread: &ThreadId) -> Result<Option<IssueRecord>, PipelineError> {
        Ok(self.store.find_by_thread(thread).await?)
    }

    pub async fn materialize(
        &self,
        action: Materialization<'_>,
        candidate: &IssueCandidate,
        snapshot: &ThreadSnapshot,
    ) -> Result<IssueRecord, PipelineError> {
        let permalink = self.thread_permalink(&snapshot.id);
        let body = render_body(candidate, snapshot, permalink.as_deref());
        match action {
            Materialization::Create => match self.create(candidate, snapshot, body).await {
                Err(PipelineError::DuplicateMaterializationAttempt {
                    thread,
                    external_id,
                }) => {
                    info!(%thread, %external_id, "Issue already materialized, reusing record");
                    self.store
                        .find_by_thread(&snapshot.id)
                        .await?
                        .ok_or_else(|| PipelineError::Repository(RepositoryError::NotFound(snapshot.id.key())))
                }
                other => other,
            },
            Materialization::Update(record) => self.update(record, candidate, body).await,
        }
    }

    async fn create(
        &self,
        candidate: &IssueCandidate,
        snapshot: &ThreadSnapshot,
        body: String,
    ) -> Result<IssueRecord, PipelineError> {
        let marker = snapshot.id.marker();

        // A previous create may have reached the tracker without the local
        // record being written. The marker lookup finds it.
        let existing = self
            .retry
            .run("tracker.find_issue_by_marker", || {
                self.tracker.find_issue_by_marker(&marker)
            })
            .await
            .map_err(|err| PipelineError::external("tracker", err))?;

        let issue = match existing {
            Some(issue) => {
                warn!(
                    thread = %snapshot.id,
                    external_id = %issue.id,
                    "Tracker already has an issue for this thread, backfilling record"
                );
                self.retry
                    .run("tracker.update_issue", || {
                        self.tracker.update_issue(&issue.id, &body)
                    })
                    .await
                    .map_err(|err| PipelineError::external("tracker", err))?;
                issue
            }
            None => {
                let new_issue = NewIssue {
                    title: candidate.fields.title.clone(),
                    body,
                    labels: merge_labels(&candidate.fields.labels, &self.defaults.labels),
                    assignee: self.defaults.assignee.clone(),
                };
                // Not retried: a create that timed out may still have landed,
                // and the next cycle reconciles through the marker.
                self.tracker
                    .create_issue(&new_issue)
                    .await
                    .map_err(|err| PipelineError::external("tracker", err))?
            }
        };

        let record = NewIssueRecord {
            thread: snapshot.id.clone(),
            external_id: issue.id.clone(),
            external_url: issue.url.clone(),
            content_hash: content_hash(&candidate.fields),
            fields: candidate.fields.clone(),
        };
        match self.store.insert(record).await {
            Ok(record) => {
                info!(
                    thread = %snapshot.id,
                    external_id = %record.external_id,
                    "Issue record stored"
                );
                Ok(record)
            }
            Err(RepositoryError::Conflict(thread)) => {
                Err(PipelineError::DuplicateMaterializationAttempt {
                    thread,
                    external_id: issue.id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(
        &self,
        record: &IssueRecord,
        candidate: &IssueCandidate,
        body: String,
    ) -> Result<IssueRecord, PipelineError> {
        self.retry
            .run("tracker.update_issue", || {
                self.tracker.update_issue(&record.external_id, &body)
            })
            .await
            .map_err(|err| PipelineError::external("tracker", err))?;

        let hash = content_hash(&candidate.fields);
        let updated = self
            .store
            .record_sync(record.id, &hash, &candidate.fields)
            .await?;
        info!(
            thread = %record.thread,
            external_id = %record.external_id,
            "Linked issue updated"
        );
        Ok(updated)
    }
}

fn merge_labels(candidate: &[String], defaults: &[String]) -> Vec<String> {
    let mut labels: Vec<String> = candidate
        .iter()
        .chain(defaults)
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .collect();
    labels.sort();
    labels.dedup();
    labels
}

/// Markdown body for the tracker issue, ending with the thread marker.
pub fn render_body(
    candidate: &IssueCandidate,
    snapshot: &ThreadSnapshot,
    permalink: Option<&str>,
) -> String {
    let fields = &candidate.fields;
    let mut body = String::new();

    let _ = writeln!(body, "## Description\n\n{}\n", fields.description);

    if !fields.steps_to_reproduce.is_empty() {
        body.push_str("## Steps to Reproduce\n\n");
        for (n, step) in fields.steps_to_reproduce.iter().enumerate() {
            let _ = writeln!(body, "{}. {}", n + 1, step);
        }
        body.push('\n');
    }

    if fields.expected_behavior.is_some() || fields.actual_behavior.is_some() {
        body.push_str("## Expected vs Actual\n\n");
        if let Some(expected) = &fields.expected_behavior {
            let _ = writeln!(body, "**Expected:** {}", expected);
        }
        if let Some(actual) = &fields.actual_behavior {
            let _ = writeln!(body, "**Actual:** {}", actual);
        }
        body.push('\n');
    }

    if let Some(context) = &fields.additional_context {
        let _ = writeln!(body, "## Additional Context\n\n{}\n", context);
    }

    if !candidate.related_events.is_empty() {
        body.push_str("## Related Errors\n\n");
        for event in &candidate.related_events {
            let name = event.short_id.as_deref().unwrap_or(&event.id);
            let level = event.level.as_deref().unwrap_or("error");
            match &event.permalink {
                Some(link) => {
                    let _ = write!(body, "- [{}]({}) {}", name, link, event.title);
                }
                None => {
                    let _ = write!(body, "- {} {}", name, event.title);
                }
            }
            let _ = writeln!(
                body,
                " ({}, {} events, last seen {})",
                level,
                event.count,
                event.last_seen.to_rfc3339()
            );
        }
        body.push('\n');
    }

    if !candidate.similar_issues.is_empty() {
        body.push_str("## Possibly Related Issues\n\n");
        for issue in &candidate.similar_issues {
            let state = if issue.open { "open" } else { "closed" };
            match &issue.url {
                Some(url) => {
                    let _ = write!(body, "- [#{}]({}) {}", issue.id, url, issue.title);
                }
                None => {
                    let _ = write!(body, "- #{} {}", issue.id, issue.title);
                }
            }
            let _ = writeln!(
                body,
                " ({}, {:.0}% similar)",
                state,
                issue.similarity * 100.0
            );
        }
        body.push('\n');
    }

    let attachments: Vec<_> = snapshot.attachments().collect();
    if !attachments.is_empty() {
        body.push_str("## Attachments\n\n");
        for attachment in attachments {
            if attachment.is_image() {
                let _ = writeln!(body, "![{}]({})", attachment.filename, attachment.url);
            } else {
                let _ = writeln!(body, "- [{}]({})", attachment.filename, attachment.url);
            }
        }
        body.push('\n');
    }

    if let Some(link) = permalink {
        let _ = writeln!(
            body,
            "## Related Discussion\n\n[View original thread in chat]({})\n",
            link
        );
    }

    body.push_str("## Conversation\n\n");
    let _ = writeln!(body, "From #{}:\n", snapshot.channel_name);
    for message in &snapshot.messages {
        let _ = writeln!(
            body,
            "> **{}** ({}): {}",
            message.author_label(),
            message.timestamp.format("%Y-%m-%d %H:%M UTC"),
            message.text.replace('\n', "\n> ")
        );
        body.push_str(">\n");
    }
    body.push('\n');

    body.push_str("---\n");
    let _ = writeln!(
        body,
        "Type: {} | Severity: {} | Confidence: {:.0}% | Model: {}",
        fields.issue_type.as_str(),
        fields.severity.as_str(),
        candidate.confidence * 100.0,
        candidate.model
    );
    let _ = writeln!(body, "\n<!-- {} -->", snapshot.id.marker());
    body
}

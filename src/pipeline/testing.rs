//! In-process fakes and fixtures shared by the pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sea_orm::DbErr;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::connectors::{
    ChatReplier, ConnectorError, ErrorMonitor, ExternalIssue, IssueQuery, IssueTracker,
    LlmCapability, LlmPrompt, NewIssue, OutputSchema, TrackerIssue,
};
use crate::db;
use crate::error::RepositoryError;
use crate::models::{
    CandidateFields, IssueCandidate, IssueRecord, IssueType, Message, MonitoringEvent, Severity,
    ThreadId, ThreadSnapshot, ThreadState, TimeWindow,
};
use crate::pipeline::similarity::content_hash;
use crate::repositories::{IssueRecordRepository, IssueRecordStore, NewIssueRecord};

type Scripted = Result<String, ConnectorError>;

/// LLM answering from a per-schema script. The last entry of each script
/// repeats once everything before it has been consumed.
pub struct ScriptedLlm {
    scripts: Mutex<HashMap<&'static str, VecDeque<Scripted>>>,
    prompts: Mutex<Vec<(&'static str, LlmPrompt)>>,
}

impl ScriptedLlm {
    pub fn new(classification: Vec<Scripted>, extraction: Vec<Scripted>) -> Arc<Self> {
        let mut scripts = HashMap::new();
        scripts.insert("classification", classification.into());
        scripts.insert("issue_extraction", extraction.into());
        Arc::new(Self {
            scripts: Mutex::new(scripts),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Always actionable, always a complete extraction with `title`.
    pub fn confident(title: &str) -> Arc<Self> {
        Self::new(
            vec![Ok(classification_json(true, 0.9))],
            vec![Ok(full_extraction_json(title))],
        )
    }

    /// Replace the script for `schema`, e.g. between two cycles of one test.
    pub fn rescript(&self, schema: &'static str, responses: Vec<Scripted>) {
        self.scripts.lock().unwrap().insert(schema, responses.into());
    }

    pub fn calls_for(&self, schema: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| *name == schema)
            .count()
    }

    pub fn last_prompt_for(&self, schema: &str) -> Option<LlmPrompt> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(name, _)| *name == schema)
            .map(|(_, prompt)| prompt.clone())
    }
}

#[async_trait]
impl LlmCapability for ScriptedLlm {
    async fn invoke(&self, prompt: &LlmPrompt, schema: &OutputSchema) -> Result<String, ConnectorError> {
        self.prompts.lock().unwrap().push((schema.name, prompt.clone()));
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(schema.name).or_default();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.unwrap_or_else(|| {
            Err(ConnectorError::MalformedResponse {
                details: format!("no scripted response for {}", schema.name),
                partial_data: None,
            })
        })
    }

    fn model_id(&self) -> String {
        "scripted-model".to_string()
    }
}

#[derive(Default)]
struct TrackerState {
    /// (id, body) of every issue the fake tracker knows about
    issues: Vec<(String, String)>,
    created: Vec<NewIssue>,
    next_id: u64,
    search_error: Option<ConnectorError>,
    forget_markers: bool,
    /// Issues visible to keyword search
    searchable: Vec<TrackerIssue>,
    queries: Vec<IssueQuery>,
}

/// Tracker keeping issues in memory. With a gate, `create_issue` signals
/// `entered` and then blocks until `release` is notified.
#[derive(Default)]
pub struct FakeTracker {
    state: Mutex<TrackerState>,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the tracker plus (`entered`, `release`).
    pub fn gated() -> (Arc<Self>, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let tracker = Arc::new(Self {
            gate: Some((entered.clone(), release.clone())),
            ..Self::default()
        });
        (tracker, entered, release)
    }

    pub fn seed_issue(&self, marker: &str, id: &str) {
        self.state
            .lock()
            .unwrap()
            .issues
            .push((id.to_string(), format!("seeded\n<!-- {} -->", marker)));
    }

    /// Make `issue` visible to keyword search.
    pub fn seed_searchable(&self, issue: TrackerIssue) {
        self.state.lock().unwrap().searchable.push(issue);
    }

    pub fn search_queries(&self) -> Vec<IssueQuery> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn forget_markers(&self) {
        self.state.lock().unwrap().forget_markers = true;
    }

    pub fn fail_search(&self, error: ConnectorError) {
        self.state.lock().unwrap().search_error = Some(error);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<NewIssue> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn body_of(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .issues
            .iter()
            .find(|(issue_id, _)| issue_id == id)
            .map(|(_, body)| body.clone())
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn create_issue(&self, issue: &NewIssue) -> Result<ExternalIssue, ConnectorError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.issues.push((id.clone(), issue.body.clone()));
        state.created.push(issue.clone());
        Ok(ExternalIssue {
            url: Some(format!("https://tracker.test/issues/{}", id)),
            id,
        })
    }

    async fn update_issue(&self, external_id: &str, body: &str) -> Result<(), ConnectorError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        match state.issues.iter_mut().find(|(id, _)| id == external_id) {
            Some((_, stored)) => {
                *stored = body.to_string();
                Ok(())
            }
            None => Err(ConnectorError::HttpError {
                status: 404,
                body: None,
            }),
        }
    }

    async fn find_issue_by_marker(&self, marker: &str) -> Result<Option<ExternalIssue>, ConnectorError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.search_error {
            return Err(err.clone());
        }
        if state.forget_markers {
            return Ok(None);
        }
        let comment = format!("<!-- {} -->", marker);
        Ok(state
            .issues
            .iter()
            .find(|(_, body)| body.contains(&comment))
            .map(|(id, _)| ExternalIssue {
                id: id.clone(),
                url: Some(format!("https://tracker.test/issues/{}", id)),
            }))
    }

    async fn search_issues(&self, query: &IssueQuery) -> Result<Vec<TrackerIssue>, ConnectorError> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(query.clone());
        let keywords: Vec<String> = query.keywords.iter().map(|k| k.to_lowercase()).collect();
        Ok(state
            .searchable
            .iter()
            .filter(|issue| {
                let text = format!("{} {}", issue.title, issue.body).to_lowercase();
                keywords.iter().any(|keyword| text.contains(keyword))
            })
            .take(query.limit)
            .cloned()
            .collect())
    }
}

/// Searchable tracker issue with the given text.
pub fn tracker_issue(id: &str, title: &str, body: &str, open: bool) -> TrackerIssue {
    TrackerIssue {
        id: id.to_string(),
        title: title.to_string(),
        url: Some(format!("https://tracker.test/issues/{}", id)),
        open,
        created_at: Some(Utc::now() - chrono::Duration::days(10)),
        closed_at: (!open).then(|| Utc::now() - chrono::Duration::days(5)),
        body: body.to_string(),
        labels: Vec::new(),
    }
}

enum MonitorMode {
    Events(Vec<MonitoringEvent>),
    Failing,
    Hanging,
}

pub struct FakeMonitor {
    mode: MonitorMode,
    calls: AtomicUsize,
}

impl FakeMonitor {
    pub fn with_events(events: Vec<MonitoringEvent>) -> Arc<Self> {
        Self::build(MonitorMode::Events(events))
    }

    pub fn failing() -> Arc<Self> {
        Self::build(MonitorMode::Failing)
    }

    pub fn hanging() -> Arc<Self> {
        Self::build(MonitorMode::Hanging)
    }

    fn build(mode: MonitorMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ErrorMonitor for FakeMonitor {
    async fn query_events(
        &self,
        _window: &TimeWindow,
        _service_hint: Option<&str>,
    ) -> Result<Vec<MonitoringEvent>, ConnectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            MonitorMode::Events(events) => Ok(events.clone()),
            MonitorMode::Failing => Err(ConnectorError::HttpError {
                status: 502,
                body: None,
            }),
            MonitorMode::Hanging => std::future::pending().await,
        }
    }
}

/// Records replies instead of posting them.
#[derive(Default)]
pub struct RecordingReplier {
    replies: Mutex<Vec<(String, String, String)>>,
}

impl RecordingReplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replies(&self) -> Vec<String> {
        self.replies
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ChatReplier for RecordingReplier {
    async fn reply(&self, channel_id: &str, root_message_id: &str, text: &str) -> Result<(), ConnectorError> {
        self.replies.lock().unwrap().push((
            channel_id.to_string(),
            root_message_id.to_string(),
            text.to_string(),
        ));
        Ok(())
    }
}

/// Store whose writes always fail, as if the database went away after the
/// tracker call.
pub struct FailingStore;

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl IssueRecordStore for FailingStore {
    async fn find_by_thread(&self, _thread: &ThreadId) -> Result<Option<IssueRecord>, RepositoryError> {
        Ok(None)
    }

    async fn insert(&self, _record: NewIssueRecord) -> Result<IssueRecord, RepositoryError> {
        Err(RepositoryError::Database(DbErr::Custom("disk I/O error".into())))
    }

    async fn record_sync(
        &self,
        id: Uuid,
        _content_hash: &str,
        _fields: &CandidateFields,
    ) -> Result<IssueRecord, RepositoryError> {
        Err(RepositoryError::NotFound(id.to_string()))
    }
}

/// Record store in a map. Used where a real database would not cooperate
/// with paused time.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<ThreadId, IssueRecord>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl IssueRecordStore for MemoryStore {
    async fn find_by_thread(&self, thread: &ThreadId) -> Result<Option<IssueRecord>, RepositoryError> {
        Ok(self.records.lock().unwrap().get(thread).cloned())
    }

    async fn insert(&self, record: NewIssueRecord) -> Result<IssueRecord, RepositoryError> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.thread) {
            return Err(RepositoryError::Conflict(record.thread.key()));
        }
        let now = Utc::now();
        let stored = IssueRecord {
            id: Uuid::new_v4(),
            thread: record.thread.clone(),
            external_id: record.external_id,
            external_url: record.external_url,
            content_hash: record.content_hash,
            fields: Some(record.fields),
            created_at: now,
            last_synced_at: now,
        };
        records.insert(record.thread, stored.clone());
        Ok(stored)
    }

    async fn record_sync(
        &self,
        id: Uuid,
        content_hash: &str,
        fields: &CandidateFields,
    ) -> Result<IssueRecord, RepositoryError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .values_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        record.content_hash = content_hash.to_string();
        record.fields = Some(fields.clone());
        record.last_synced_at = Utc::now();
        Ok(record.clone())
    }
}

pub async fn memory_store() -> Arc<IssueRecordRepository> {
    let config = AppConfig {
        database_url: "sqlite::memory:".to_string(),
        ..AppConfig::default()
    };
    let conn = db::init_pool(&config).await.unwrap();
    db::run_migrations(&conn).await.unwrap();
    Arc::new(IssueRecordRepository::new(Arc::new(conn)))
}

pub fn classification_json(actionable: bool, confidence: f32) -> String {
    json!({
        "actionable": actionable,
        "confidence": confidence,
        "reason": "test verdict"
    })
    .to_string()
}

pub fn full_extraction_json(title: &str) -> String {
    json!({
        "title": title,
        "description": "Users get a 500 error on the payment step of checkout.",
        "issue_type": "bug",
        "severity": "high",
        "component": "checkout",
        "service": "payments-api",
        "steps_to_reproduce": ["Add an item to the cart", "Pay with a credit card"],
        "expected_behavior": "Order is confirmed",
        "actual_behavior": "HTTP 500 error page",
        "additional_context": null,
        "labels": ["checkout"]
    })
    .to_string()
}

pub fn sample_fields() -> CandidateFields {
    CandidateFields {
        title: "Checkout fails when paying with card".to_string(),
        description: "Users get a 500 error on the payment step of checkout.".to_string(),
        issue_type: IssueType::Bug,
        severity: Severity::High,
        component: Some("checkout".to_string()),
        steps_to_reproduce: vec![
            "Add an item to the cart".to_string(),
            "Pay with a credit card".to_string(),
        ],
        expected_behavior: Some("Order is confirmed".to_string()),
        actual_behavior: Some("HTTP 500 error page".to_string()),
        additional_context: None,
        service: Some("payments-api".to_string()),
        labels: vec!["bug".to_string(), "checkout".to_string()],
    }
}

pub fn message(id: &str, author: &str, text: &str, minute: u32) -> Message {
    Message {
        id: id.to_string(),
        author_id: format!("user-{}", author),
        author_name: Some(author.to_string()),
        text: text.to_string(),
        timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 10, minute, 0).unwrap(),
        attachments: vec![],
    }
}

pub fn sample_snapshot() -> ThreadSnapshot {
    let messages = vec![
        message("root-1", "alice", "Checkout is throwing a 500 when I pay by card", 0),
        message("m-2", "bob", "Same here, started after this morning's deploy", 2),
        message("m-3", "alice", "Steps: add anything to the cart, pay with a Visa", 4),
    ];
    ThreadSnapshot {
        id: ThreadId::new("chan-1", "root-1"),
        channel_name: "support".to_string(),
        first_seen: messages[0].timestamp,
        last_activity: messages[2].timestamp,
        messages,
        state: ThreadState::PendingExtraction,
        generation: 3,
        linked_issue: None,
    }
}

pub fn sample_candidate(confidence: f32) -> IssueCandidate {
    IssueCandidate {
        thread: ThreadId::new("chan-1", "root-1"),
        fields: sample_fields(),
        classifier_confidence: confidence,
        completeness: 1.0,
        confidence,
        low_confidence: confidence < 0.7,
        model: "scripted-model".to_string(),
        extracted_at: Utc::now(),
        related_events: Vec::new(),
        similar_issues: Vec::new(),
    }
}

pub fn sample_record(candidate: &IssueCandidate) -> IssueRecord {
    let now = Utc::now();
    IssueRecord {
        id: Uuid::new_v4(),
        thread: candidate.thread.clone(),
        external_id: "101".to_string(),
        external_url: Some("https://tracker.test/issues/101".to_string()),
        content_hash: content_hash(&candidate.fields),
        fields: Some(candidate.fields.clone()),
        created_at: now,
        last_synced_at: now,
    }
}

/// Event first and last seen at 2026-03-01 `hour`:`minute` UTC.
pub fn monitoring_event(id: &str, service: Option<&str>, hour: u32, minute: u32) -> MonitoringEvent {
    let at = Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0).unwrap();
    MonitoringEvent {
        id: id.to_string(),
        title: format!("Error {}", id),
        short_id: Some(format!("APP-{}", id)),
        service: service.map(str::to_string),
        level: Some("error".to_string()),
        count: 3,
        first_seen: at,
        last_seen: at,
        permalink: Some(format!("https://monitor.test/issues/{}/", id)),
    }
}

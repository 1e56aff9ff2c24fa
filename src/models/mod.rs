//! # Data Models
//!
//! Domain types shared by the pipeline stages, plus the SeaORM entity backing
//! persisted issue records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub mod candidate;
pub mod issue_record;
pub mod thread;

pub use candidate::{
    CandidateFields, IssueCandidate, IssueType, MonitoringEvent, Severity, SimilarIssue,
    TimeWindow,
};
pub use issue_record::Entity as IssueRecordEntity;
pub use thread::{Attachment, ChatEvent, Message, ThreadId, ThreadSnapshot, ThreadState};

/// Persistent link between a thread and the tracker issue created from it.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueRecord {
    pub id: Uuid,
    pub thread: ThreadId,
    pub external_id: String,
    pub external_url: Option<String>,
    pub content_hash: String,
    /// Fields last pushed to the tracker. `None` if the stored snapshot could
    /// not be decoded, which forces the next material change through.
    pub fields: Option<CandidateFields>,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

impl From<issue_record::Model> for IssueRecord {
    fn from(model: issue_record::Model) -> Self {
        Self {
            id: model.id,
            thread: ThreadId::new(model.channel_id, model.root_message_id),
            external_id: model.external_id,
            external_url: model.external_url,
            content_hash: model.content_hash,
            fields: serde_json::from_value(model.fields).ok(),
            created_at: model.created_at.with_timezone(&Utc),
            last_synced_at: model.last_synced_at.with_timezone(&Utc),
        }
    }
}

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "threadwatch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

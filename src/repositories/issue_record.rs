//! Issue record repository
//!
//! Persists the thread -> tracker issue link. The unique index on the thread
//! key is what finally guarantees at most one record per conversation.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{RepositoryError, is_unique_violation};
use crate::models::issue_record::{self, Entity as IssueRecords};
use crate::models::{CandidateFields, IssueRecord, ThreadId};

/// Data for a record written after the first successful materialization.
#[derive(Debug, Clone)]
pub struct NewIssueRecord {
    pub thread: ThreadId,
    pub external_id: String,
    pub external_url: Option<String>,
    pub content_hash: String,
    pub fields: CandidateFields,
}

/// Storage contract the materializer depends on.
#[async_trait]
pub trait IssueRecordStore: Send + Sync {
    async fn find_by_thread(&self, thread: &ThreadId)
    -> Result<Option<IssueRecord>, RepositoryError>;

    /// Fails with [`RepositoryError::Conflict`] when the thread already has a record.
    async fn insert(&self, record: NewIssueRecord) -> Result<IssueRecord, RepositoryError>;

    /// Refresh hash, field snapshot and last-sync time after an accepted update.
    async fn record_sync(
        &self,
        id: Uuid,
        content_hash: &str,
        fields: &CandidateFields,
    ) -> Result<IssueRecord, RepositoryError>;
}

/// SeaORM-backed [`IssueRecordStore`]
#[derive(Debug, Clone)]
pub struct IssueRecordRepository {
    pub db: Arc<DatabaseConnection>,
}

impl IssueRecordRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Look up a record by the tracker-side id.
    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<IssueRecord>, RepositoryError> {
        let record = IssueRecords::find()
            .filter(issue_record::Column::ExternalId.eq(external_id))
            .one(&*self.db)
            .await
            .map_err(RepositoryError::database_error)?;
        Ok(record.map(IssueRecord::from))
    }
}

#[async_trait]
impl IssueRecordStore for IssueRecordRepository {
    async fn find_by_thread(
        &self,
        thread: &ThreadId,
    ) -> Result<Option<IssueRecord>, RepositoryError> {
        let record = IssueRecords::find()
            .filter(issue_record::Column::ThreadKey.eq(thread.key()))
            .one(&*self.db)
            .await
            .map_err(RepositoryError::database_error)?;
        Ok(record.map(IssueRecord::from))
    }

    async fn insert(&self, record: NewIssueRecord) -> Result<IssueRecord, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let thread_key = record.thread.key();
        let active = issue_record::ActiveModel {
            id: Set(Uuid::new_v4()),
            thread_key: Set(thread_key.clone()),
            channel_id: Set(record.thread.channel_id.clone()),
            root_message_id: Set(record.thread.root_message_id.clone()),
            external_id: Set(record.external_id),
            external_url: Set(record.external_url),
            content_hash: Set(record.content_hash),
            fields: Set(serde_json::to_value(&record.fields)?),
            created_at: Set(now),
            last_synced_at: Set(now),
        };

        match active.insert(&*self.db).await {
            Ok(model) => Ok(model.into()),
            Err(err) if is_unique_violation(&err) => Err(RepositoryError::Conflict(thread_key)),
            Err(err) => Err(RepositoryError::database_error(err)),
        }
    }

    async fn record_sync(
        &self,
        id: Uuid,
        content_hash: &str,
        fields: &CandidateFields,
    ) -> Result<IssueRecord, RepositoryError> {
        let existing = IssueRecords::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(RepositoryError::database_error)?
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;

        let mut active: issue_record::ActiveModel = existing.into();
        active.content_hash = Set(content_hash.to_string());
        active.fields = Set(serde_json::to_value(fields)?);
        active.last_synced_at = Set(Utc::now().fixed_offset());

        let model = active
            .update(&*self.db)
            .await
            .map_err(RepositoryError::database_error)?;
        Ok(model.into())
    }
}

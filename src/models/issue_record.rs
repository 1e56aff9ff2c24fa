//! Issue record entity model
//!
//! SeaORM entity for the `issue_records` table: the persistent link between a
//! chat thread and the tracker issue materialized from it.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "issue_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// `<channel_id>/<root_message_id>`, unique per table
    #[sea_orm(unique)]
    pub thread_key: String,

    pub channel_id: String,

    pub root_message_id: String,

    /// Tracker-side identifier (issue number for GitHub)
    pub external_id: String,

    pub external_url: Option<String>,

    /// Hash of the normalized candidate fields last pushed to the tracker
    pub content_hash: String,

    /// Normalized candidate fields last pushed to the tracker
    pub fields: JsonValue,

    pub created_at: DateTimeWithTimeZone,

    pub last_synced_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

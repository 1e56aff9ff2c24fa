//! # Repository Layer
//!
//! SeaORM-backed persistence behind small storage traits.

pub mod issue_record;

pub use issue_record::{IssueRecordRepository, IssueRecordStore, NewIssueRecord};

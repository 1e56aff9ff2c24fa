//! Database migrations for threadwatch.
//!
//! Only the issue record table is persisted; thread content lives in memory.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000001_create_issue_records;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m2026_10_01_000001_create_issue_records::Migration)]
    }
}

//! Migration to create the issue_records table.
//!
//! One row links a chat thread (channel + root message) to the tracker issue
//! created for it. The unique index on `thread_key` is what keeps a thread
//! from ever holding two external references.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(IssueRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IssueRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(IssueRecords::ThreadKey).string().not_null())
                    .col(ColumnDef::new(IssueRecords::ChannelId).string().not_null())
                    .col(
                        ColumnDef::new(IssueRecords::RootMessageId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IssueRecords::ExternalId).string().not_null())
                    .col(ColumnDef::new(IssueRecords::ExternalUrl).string().null())
                    .col(
                        ColumnDef::new(IssueRecords::ContentHash)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IssueRecords::Fields).json().not_null())
                    .col(
                        ColumnDef::new(IssueRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(IssueRecords::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-issue_records-thread_key")
                    .table(IssueRecords::Table)
                    .col(IssueRecords::ThreadKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-issue_records-external_id")
                    .table(IssueRecords::Table)
                    .col(IssueRecords::ExternalId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(IssueRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum IssueRecords {
    Table,
    Id,
    ThreadKey,
    ChannelId,
    RootMessageId,
    ExternalId,
    ExternalUrl,
    ContentHash,
    Fields,
    CreatedAt,
    LastSyncedAt,
}

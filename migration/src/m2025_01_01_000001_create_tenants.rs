//! Migration to create the tenants table.
//!
//! The tenant registry holds eligibility flags, failure counters, the dispatch
//! attempt token, and the backfill cursor for every onboarded tenant.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tenants::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Tenants::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Tenants::Name).text().not_null())
                    .col(
                        ColumnDef::new(Tenants::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Tenants::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(Tenants::Kind)
                            .text()
                            .not_null()
                            .default("existing"),
                    )
                    .col(
                        ColumnDef::new(Tenants::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tenants::FailureCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tenants::MaxFailures)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(Tenants::LastRunStatus)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Tenants::LastRunAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Tenants::RunStartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Tenants::Attempt)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Tenants::BackfillStartPeriod).text().null())
                    .col(
                        ColumnDef::new(Tenants::BackfillCompleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Tenants::CurrentPeriodCursor).text().null())
                    .col(ColumnDef::new(Tenants::LastCompletedPeriod).text().null())
                    .col(
                        ColumnDef::new(Tenants::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Tenants::UpdatedAt)
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
                    .name("idx_tenants_name_unique")
                    .table(Tenants::Table)
                    .col(Tenants::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Eligibility scans filter on these three columns.
        manager
            .create_index(
                Index::create()
                    .name("idx_tenants_eligibility")
                    .table(Tenants::Table)
                    .col(Tenants::Enabled)
                    .col(Tenants::Status)
                    .col(Tenants::LastRunStatus)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_tenants_eligibility").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_tenants_name_unique").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Tenants::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
    Name,
    Enabled,
    Status,
    Kind,
    Priority,
    FailureCount,
    MaxFailures,
    LastRunStatus,
    LastRunAt,
    RunStartedAt,
    Attempt,
    BackfillStartPeriod,
    BackfillCompleted,
    CurrentPeriodCursor,
    LastCompletedPeriod,
    CreatedAt,
    UpdatedAt,
}

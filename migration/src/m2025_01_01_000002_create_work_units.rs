//! Migration to create the work_units table.
//!
//! One row per (tenant, period) processing attempt. The unique index on
//! `(tenant_id, period)` is what keeps a period from being tracked twice.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WorkUnits::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WorkUnits::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WorkUnits::TenantId).uuid().not_null())
                    .col(ColumnDef::new(WorkUnits::Period).text().not_null())
                    .col(
                        ColumnDef::new(WorkUnits::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(WorkUnits::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WorkUnits::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WorkUnits::ProcessedCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WorkUnits::FailedCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(WorkUnits::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(WorkUnits::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WorkUnits::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(WorkUnits::Attempt)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WorkUnits::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(WorkUnits::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_work_units_tenant_id")
                            .from(WorkUnits::Table, WorkUnits::TenantId)
                            .to(Tenants::Table, Tenants::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_work_units_tenant_period_unique")
                    .table(WorkUnits::Table)
                    .col(WorkUnits::TenantId)
                    .col(WorkUnits::Period)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Reaper scans in-flight units by start time.
        manager
            .create_index(
                Index::create()
                    .name("idx_work_units_status_started")
                    .table(WorkUnits::Table)
                    .col(WorkUnits::Status)
                    .col(WorkUnits::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_work_units_status_started")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_work_units_tenant_period_unique")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(WorkUnits::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WorkUnits {
    Table,
    Id,
    TenantId,
    Period,
    Status,
    StartedAt,
    CompletedAt,
    ProcessedCount,
    FailedCount,
    ErrorMessage,
    RetryCount,
    MaxRetries,
    Attempt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Tenants {
    Table,
    Id,
}

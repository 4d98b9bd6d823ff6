//! Work unit entity model
//!
//! One row per (tenant, period) processing attempt in the work-unit ledger.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::period::Period;

/// Message recorded on units reclaimed by the reaper.
pub const STALE_ERROR_MESSAGE: &str = "stale - presumed crashed";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "retrying")]
    Retrying,
}

/// Rejected work-unit transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkUnitError {
    #[error("work unit {period} cannot be retried (status {status:?}, {retry_count}/{max_retries} retries used)")]
    NotRetryable {
        period: String,
        status: WorkUnitStatus,
        retry_count: i32,
        max_retries: i32,
    },
    #[error("work unit {period} is completed and immutable")]
    Completed { period: String },
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "work_units")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Calendar month as `YYYY-MM`
    pub period: String,
    pub status: WorkUnitStatus,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
    pub processed_count: i64,
    pub failed_count: i64,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Monotonic dispatch token, bumped whenever the unit enters flight
    pub attempt: i32,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tenant::Entity",
        from = "Column::TenantId",
        to = "super::tenant::Column::Id",
        on_delete = "Cascade"
    )]
    Tenant,
}

impl Related<super::tenant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Builds a fresh pending unit.
    pub fn new_pending(
        tenant_id: Uuid,
        period: Period,
        max_retries: i32,
        now: DateTimeWithTimeZone,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            period: period.to_string(),
            status: WorkUnitStatus::Pending,
            started_at: None,
            completed_at: None,
            processed_count: 0,
            failed_count: 0,
            error_message: None,
            retry_count: 0,
            max_retries,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn period(&self) -> Option<Period> {
        self.period.parse().ok()
    }

    pub fn is_completed(&self) -> bool {
        self.status == WorkUnitStatus::Completed
    }

    /// A pipeline run holds this unit. A `retrying` unit only counts once a
    /// dispatch has resumed it and stamped `started_at`.
    pub fn is_processing(&self) -> bool {
        match self.status {
            WorkUnitStatus::Running => true,
            WorkUnitStatus::Retrying => self.started_at.is_some(),
            _ => false,
        }
    }

    /// Queued for retry by an operator, not yet picked up by a dispatch.
    pub fn awaiting_dispatch(&self) -> bool {
        self.status == WorkUnitStatus::Retrying && self.started_at.is_none()
    }

    /// Enters the running phase with fresh counters.
    pub fn start_processing(&mut self, now: DateTimeWithTimeZone) -> Result<(), WorkUnitError> {
        self.ensure_mutable()?;
        self.status = WorkUnitStatus::Running;
        self.started_at = Some(now);
        self.completed_at = None;
        self.processed_count = 0;
        self.failed_count = 0;
        self.error_message = None;
        self.attempt += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete_processing(
        &mut self,
        processed: i64,
        failed: i64,
        now: DateTimeWithTimeZone,
    ) -> Result<(), WorkUnitError> {
        self.ensure_mutable()?;
        self.status = WorkUnitStatus::Completed;
        self.completed_at = Some(now);
        self.processed_count = processed;
        self.failed_count = failed;
        self.error_message = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail_processing(
        &mut self,
        message: impl Into<String>,
        processed: i64,
        failed: i64,
        now: DateTimeWithTimeZone,
    ) -> Result<(), WorkUnitError> {
        self.ensure_mutable()?;
        self.status = WorkUnitStatus::Failed;
        self.completed_at = Some(now);
        self.processed_count = processed;
        self.failed_count = failed;
        self.error_message = Some(message.into());
        self.updated_at = now;
        Ok(())
    }

    /// `status = failed ∧ retry_count < max_retries`
    pub fn can_retry(&self) -> bool {
        self.status == WorkUnitStatus::Failed && self.retry_count < self.max_retries
    }

    /// Consumes one retry and queues the unit as `retrying`. Progress
    /// counters are kept. No run is in flight until [`Model::resume`].
    pub fn prepare_retry(&mut self, now: DateTimeWithTimeZone) -> Result<(), WorkUnitError> {
        if !self.can_retry() {
            return Err(WorkUnitError::NotRetryable {
                period: self.period.clone(),
                status: self.status,
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.error_message = None;
        self.completed_at = None;
        self.status = WorkUnitStatus::Retrying;
        self.started_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Hands a `retrying` unit to a new dispatch without touching counters.
    pub fn resume(&mut self, now: DateTimeWithTimeZone) {
        self.attempt += 1;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    fn ensure_mutable(&self) -> Result<(), WorkUnitError> {
        if self.is_completed() {
            return Err(WorkUnitError::Completed {
                period: self.period.clone(),
            });
        }
        Ok(())
    }
}

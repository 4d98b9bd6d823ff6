//! Tenant entity model
//!
//! This module contains the SeaORM entity model for the tenants table, the
//! durable registry of every tenant's eligibility flags, failure counters and
//! backfill cursor. State transitions are pure methods on [`Model`]; the
//! repository persists them under a row lock.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::period::Period;

/// Administrative status of a tenant. Only `active` tenants are eligible.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "inactive")]
    Inactive,
    #[sea_orm(string_value = "suspended")]
    Suspended,
}

/// Outcome of the tenant's most recent run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// Existing tenants process the current period only; new tenants backfill first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum TenantKind {
    #[sea_orm(string_value = "existing")]
    Existing,
    #[sea_orm(string_value = "new")]
    New,
}

/// Tenant entity
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    /// Stable tenant identifier (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Unique display name
    pub name: String,

    /// Automatic gate; cleared when failures reach `max_failures`
    pub enabled: bool,

    /// Administrative status
    pub status: TenantStatus,

    /// Existing or new (backfilling) tenant
    pub kind: TenantKind,

    /// Selection tie-break, lower runs first
    pub priority: i32,

    /// Consecutive failures since the last success
    pub failure_count: i32,

    pub max_failures: i32,

    pub last_run_status: RunStatus,

    pub last_run_at: Option<DateTimeWithTimeZone>,

    /// When the in-flight run was claimed; `None` unless running
    pub run_started_at: Option<DateTimeWithTimeZone>,

    /// Monotonic dispatch token, bumped on every claim
    pub attempt: i32,

    /// First month of the backfill window (`YYYY-MM`)
    pub backfill_start_period: Option<String>,

    pub backfill_completed: bool,

    /// Next month the backfill expects to process
    pub current_period_cursor: Option<String>,

    pub last_completed_period: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::work_unit::Entity")]
    WorkUnits,
}

impl Related<super::work_unit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WorkUnits.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// `enabled ∧ active ∧ failure_count < max_failures ∧ last_run_status ≠ running`
    pub fn is_eligible(&self) -> bool {
        self.enabled
            && self.status == TenantStatus::Active
            && self.failure_count < self.max_failures
            && self.last_run_status != RunStatus::Running
    }

    pub fn is_running(&self) -> bool {
        self.last_run_status == RunStatus::Running
    }

    /// True for a new tenant whose backfill window is not yet exhausted.
    pub fn needs_backfill(&self) -> bool {
        self.kind == TenantKind::New && !self.backfill_completed
    }

    pub fn backfill_start(&self) -> Option<Period> {
        parse_period(self.backfill_start_period.as_deref())
    }

    pub fn last_completed(&self) -> Option<Period> {
        parse_period(self.last_completed_period.as_deref())
    }

    /// Claims the tenant for a run and bumps the attempt token.
    pub fn mark_running(&mut self, now: DateTimeWithTimeZone) {
        self.last_run_status = RunStatus::Running;
        self.run_started_at = Some(now);
        self.attempt += 1;
        self.updated_at = now;
    }

    /// A single success forgives every earlier consecutive failure.
    pub fn record_success(&mut self, now: DateTimeWithTimeZone) {
        self.last_run_status = RunStatus::Success;
        self.last_run_at = Some(now);
        self.run_started_at = None;
        self.failure_count = 0;
        self.updated_at = now;
    }

    /// Records a failure; disables the tenant once the limit is reached.
    /// Returns `true` when this failure disabled the tenant.
    pub fn record_failure(&mut self, now: DateTimeWithTimeZone) -> bool {
        self.last_run_status = RunStatus::Failed;
        self.last_run_at = Some(now);
        self.run_started_at = None;
        self.failure_count += 1;
        self.updated_at = now;

        if self.enabled && self.failure_count >= self.max_failures {
            self.enabled = false;
            return true;
        }
        false
    }

    /// Operator reset: clears failures, re-enables, returns to pending.
    pub fn reset(&mut self, now: DateTimeWithTimeZone) {
        self.failure_count = 0;
        self.enabled = true;
        self.last_run_status = RunStatus::Pending;
        self.run_started_at = None;
        self.updated_at = now;
    }

    /// Undoes a claim that never reached the pipeline.
    pub fn release(&mut self, now: DateTimeWithTimeZone) {
        self.last_run_status = RunStatus::Pending;
        self.run_started_at = None;
        self.updated_at = now;
    }

    pub fn activate(&mut self, now: DateTimeWithTimeZone) {
        self.status = TenantStatus::Active;
        self.enabled = true;
        self.failure_count = 0;
        self.updated_at = now;
    }

    pub fn deactivate(&mut self, now: DateTimeWithTimeZone) {
        self.status = TenantStatus::Inactive;
        self.enabled = false;
        self.updated_at = now;
    }

    /// Turns the tenant into a new tenant whose backfill starts `months`
    /// before the period containing `now`.
    pub fn begin_backfill(&mut self, months: u32, now: DateTimeWithTimeZone) {
        let start = Period::containing(now.to_utc()).months_before(months);
        self.kind = TenantKind::New;
        self.backfill_start_period = Some(start.to_string());
        self.current_period_cursor = Some(start.to_string());
        self.last_completed_period = None;
        self.backfill_completed = false;
        self.updated_at = now;
    }

    /// Advances the backfill cursor past `period`. Completing the current
    /// period (or anything later) finishes the backfill.
    pub fn record_period_completed(
        &mut self,
        period: Period,
        current: Period,
        now: DateTimeWithTimeZone,
    ) {
        self.last_completed_period = Some(period.to_string());
        self.current_period_cursor = Some(period.next().to_string());
        if period >= current {
            self.complete_backfill(now);
        }
        self.updated_at = now;
    }

    pub fn complete_backfill(&mut self, now: DateTimeWithTimeZone) {
        self.kind = TenantKind::Existing;
        self.backfill_completed = true;
        self.updated_at = now;
    }
}

fn parse_period(raw: Option<&str>) -> Option<Period> {
    raw.and_then(|value| value.parse().ok())
}

//! # Common API Types
//!
//! Response and request bodies shared across the admin handlers.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::tenant::{self, RunStatus, TenantKind, TenantStatus};
use crate::models::work_unit::{self, WorkUnitStatus};
use crate::repositories::work_unit::StatusCounts;
use crate::scheduler::backfill::BackfillProgress;
use crate::scheduler::{ReapReport, TriggerAccepted};

/// Tenant registry record
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantResponse {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub id: Uuid,
    #[schema(example = "ADV001")]
    pub name: String,
    pub enabled: bool,
    pub status: TenantStatus,
    pub kind: TenantKind,
    /// Lower runs first
    pub priority: i32,
    pub failure_count: i32,
    pub max_failures: i32,
    pub last_run_status: RunStatus,
    /// Timestamp of the last finished run (ISO 8601)
    pub last_run_at: Option<String>,
    /// Timestamp of the live claim, when running (ISO 8601)
    pub run_started_at: Option<String>,
    /// Dispatch token of the latest claim
    pub attempt: i32,
    #[schema(example = "2023-04")]
    pub backfill_start_period: Option<String>,
    pub backfill_completed: bool,
    pub current_period_cursor: Option<String>,
    pub last_completed_period: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<tenant::Model> for TenantResponse {
    fn from(model: tenant::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            enabled: model.enabled,
            status: model.status,
            kind: model.kind,
            priority: model.priority,
            failure_count: model.failure_count,
            max_failures: model.max_failures,
            last_run_status: model.last_run_status,
            last_run_at: model.last_run_at.map(|dt| dt.to_rfc3339()),
            run_started_at: model.run_started_at.map(|dt| dt.to_rfc3339()),
            attempt: model.attempt,
            backfill_start_period: model.backfill_start_period,
            backfill_completed: model.backfill_completed,
            current_period_cursor: model.current_period_cursor,
            last_completed_period: model.last_completed_period,
            created_at: model.created_at.to_rfc3339(),
            updated_at: model.updated_at.to_rfc3339(),
        }
    }
}

/// Work-unit ledger entry
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WorkUnitResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[schema(example = "2024-05")]
    pub period: String,
    pub status: WorkUnitStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub processed_count: i64,
    pub failed_count: i64,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub attempt: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl From<work_unit::Model> for WorkUnitResponse {
    fn from(model: work_unit::Model) -> Self {
        Self {
            id: model.id,
            tenant_id: model.tenant_id,
            period: model.period,
            status: model.status,
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
            processed_count: model.processed_count,
            failed_count: model.failed_count,
            error_message: model.error_message,
            retry_count: model.retry_count,
            max_retries: model.max_retries,
            attempt: model.attempt,
            created_at: model.created_at.to_rfc3339(),
            updated_at: model.updated_at.to_rfc3339(),
        }
    }
}

/// Request payload for onboarding a tenant
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateTenantRequest {
    /// Unique display name
    #[schema(example = "ADV006")]
    pub name: String,
    /// `new` tenants backfill historical months before going live
    pub kind: TenantKind,
    /// Selection priority, lower first (default 0)
    pub priority: Option<i32>,
    /// Consecutive failures before auto-disable (default from configuration)
    pub max_failures: Option<i32>,
}

/// Backfill progress of one tenant
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BackfillProgressResponse {
    pub tenant_id: Uuid,
    pub kind: TenantKind,
    pub backfill_completed: bool,
    pub backfill_start_period: Option<String>,
    pub current_period_cursor: Option<String>,
    pub last_completed_period: Option<String>,
    pub total_months: u64,
    pub completed_months: u64,
    pub failed_months: u64,
    pub running_months: u64,
    pub pending_months: u64,
    /// Completed share of the window, one decimal
    #[schema(example = 37.5)]
    pub percent: f64,
}

impl BackfillProgressResponse {
    pub fn new(tenant: tenant::Model, progress: BackfillProgress) -> Self {
        Self {
            tenant_id: tenant.id,
            kind: tenant.kind,
            backfill_completed: tenant.backfill_completed,
            backfill_start_period: tenant.backfill_start_period,
            current_period_cursor: tenant.current_period_cursor,
            last_completed_period: tenant.last_completed_period,
            total_months: progress.total_months,
            completed_months: progress.completed_months,
            failed_months: progress.failed_months,
            running_months: progress.running_months,
            pending_months: progress.pending_months,
            percent: progress.percent,
        }
    }
}

/// Accepted out-of-band dispatch
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TriggerResponse {
    pub tenant_id: Uuid,
    /// Dispatch token of the new claim, absent while queued for a worker
    pub attempt: Option<i32>,
    /// Work-unit period, parallel mode only
    pub period: Option<String>,
    #[schema(example = "accepted")]
    pub status: String,
}

impl From<TriggerAccepted> for TriggerResponse {
    fn from(accepted: TriggerAccepted) -> Self {
        Self {
            tenant_id: accepted.tenant_id,
            attempt: accepted.attempt,
            period: accepted.period.map(|period| period.to_string()),
            status: "accepted".to_string(),
        }
    }
}

/// Scheduler status snapshot
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    #[schema(example = "round_robin")]
    pub strategy: String,
    pub eligible_count: usize,
    pub running_count: usize,
    pub timestamp: String,
}

/// Tenant counts for the stats endpoint
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct TenantStats {
    pub total: u64,
    pub new: u64,
    pub existing: u64,
    pub eligible: u64,
    pub running: u64,
    pub disabled: u64,
}

/// Work-unit counts by status
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct WorkUnitStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
    pub total: u64,
}

impl From<StatusCounts> for WorkUnitStats {
    fn from(counts: StatusCounts) -> Self {
        Self {
            total: counts.total(),
            pending: counts.pending,
            running: counts.running,
            completed: counts.completed,
            failed: counts.failed,
            retrying: counts.retrying,
        }
    }
}

/// System-wide statistics
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    pub tenants: TenantStats,
    pub work_units: WorkUnitStats,
    pub timestamp: String,
}

/// Result of a manual reaper pass
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReapResponse {
    pub units_failed: u64,
    pub tenants_failed: u64,
}

impl From<ReapReport> for ReapResponse {
    fn from(report: ReapReport) -> Self {
        Self {
            units_failed: report.units_failed,
            tenants_failed: report.tenants_failed,
        }
    }
}

/// Liveness response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    #[schema(example = "ok")]
    pub database: String,
}

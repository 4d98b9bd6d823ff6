//! # System API Handlers
//!
//! Scheduler status, registry statistics and manual maintenance.

use axum::{extract::State, response::Json};
use chrono::Utc;

use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::handlers::types::{ReapResponse, StatsResponse, StatusResponse, TenantStats};
use crate::models::tenant::TenantKind;
use crate::repositories::{TenantRepository, WorkUnitRepository};
use crate::scheduler::EligibilitySelector;
use crate::server::AppState;

/// Scheduler status
#[utoipa::path(
    get,
    path = "/api/v1/status",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Eligible and running tenant counts", body = StatusResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "system"
)]
pub async fn status(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<StatusResponse>, ApiError> {
    let tenants = TenantRepository::new(state.db.clone());
    let eligible = EligibilitySelector::new(tenants.clone())
        .list_eligible()
        .await?;
    let running = tenants.list_running().await?;

    Ok(Json(StatusResponse {
        strategy: state.orchestrator.strategy().to_string(),
        eligible_count: eligible.len(),
        running_count: running.len(),
        timestamp: Utc::now().to_rfc3339(),
    }))
}

/// Registry and ledger statistics
#[utoipa::path(
    get,
    path = "/api/v1/stats",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Tenant and work-unit counts", body = StatsResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "system"
)]
pub async fn stats(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<StatsResponse>, ApiError> {
    let tenants = TenantRepository::new(state.db.clone()).list_all().await?;
    let counts = WorkUnitRepository::new(state.db.clone())
        .status_counts()
        .await?;

    let mut tenant_stats = TenantStats::default();
    for tenant in &tenants {
        tenant_stats.total += 1;
        match tenant.kind {
            TenantKind::New => tenant_stats.new += 1,
            TenantKind::Existing => tenant_stats.existing += 1,
        }
        if tenant.is_eligible() {
            tenant_stats.eligible += 1;
        }
        if tenant.is_running() {
            tenant_stats.running += 1;
        }
        if !tenant.enabled {
            tenant_stats.disabled += 1;
        }
    }

    Ok(Json(StatsResponse {
        tenants: tenant_stats,
        work_units: counts.into(),
        timestamp: Utc::now().to_rfc3339(),
    }))
}

/// Run one reaper pass now
#[utoipa::path(
    post,
    path = "/api/v1/maintenance/reap",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "What the pass reclaimed", body = ReapResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "system"
)]
pub async fn reap(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<ReapResponse>, ApiError> {
    let report = state.reaper.sweep().await?;
    Ok(Json(report.into()))
}

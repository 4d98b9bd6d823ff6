//! # Work Unit API Handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::config::SchedulerMode;
use crate::error::{ApiError, validation_error};
use crate::handlers::types::WorkUnitResponse;
use crate::period::Period;
use crate::repositories::{TenantRepository, WorkUnitRepository};
use crate::server::AppState;

/// Work-unit history of a tenant, oldest period first
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{id}/work-units",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Tenant UUID")),
    responses(
        (status = 200, description = "Work units ordered by period", body = Vec<WorkUnitResponse>),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "work-units"
)]
pub async fn list_tenant_work_units(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<Vec<WorkUnitResponse>>, ApiError> {
    // 404 for unknown tenants rather than an empty history
    TenantRepository::new(state.db.clone()).get(tenant_id).await?;

    let units = WorkUnitRepository::new(state.db.clone())
        .list_for_tenant(tenant_id)
        .await?;
    Ok(Json(units.into_iter().map(WorkUnitResponse::from).collect()))
}

/// Queue a failed work unit for another attempt
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/retry/{period}",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Tenant UUID"),
        ("period" = String, Path, description = "Period in YYYY-MM format", example = "2024-05")
    ),
    responses(
        (status = 200, description = "Work unit queued for retry", body = WorkUnitResponse),
        (status = 400, description = "Malformed period", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant or work unit not found", body = ApiError),
        (status = 409, description = "Work unit cannot be retried, or the round-robin strategy never dispatches work units", body = ApiError)
    ),
    tag = "work-units"
)]
pub async fn retry_work_unit(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path((tenant_id, period)): Path<(Uuid, String)>,
) -> Result<Json<WorkUnitResponse>, ApiError> {
    let period: Period = period.parse().map_err(|err: crate::period::PeriodParseError| {
        validation_error(
            "Invalid period",
            serde_json::json!({ "period": err.to_string() }),
        )
    })?;

    TenantRepository::new(state.db.clone()).get(tenant_id).await?;
    if state.config.scheduler.mode == SchedulerMode::RoundRobin {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "CONFLICT",
            "work units are only dispatched by the parallel strategy",
        ));
    }

    let unit = WorkUnitRepository::new(state.db.clone())
        .retry(tenant_id, period)
        .await?;
    Ok(Json(unit.into()))
}

/// Work units currently in flight across all tenants
#[utoipa::path(
    get,
    path = "/api/v1/work-units/running",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "In-flight work units, oldest first", body = Vec<WorkUnitResponse>),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "work-units"
)]
pub async fn list_running_work_units(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<Vec<WorkUnitResponse>>, ApiError> {
    let units = WorkUnitRepository::new(state.db.clone())
        .list_running()
        .await?;
    Ok(Json(units.into_iter().map(WorkUnitResponse::from).collect()))
}

//! # Tenants API Handlers
//!
//! Onboarding, inspection and operator controls for the tenant registry.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::error::{ApiError, validation_error};
use crate::handlers::types::{
    BackfillProgressResponse, CreateTenantRequest, TenantResponse, TriggerResponse,
};
use crate::period::Period;
use crate::repositories::{NewTenant, TenantRepository, WorkUnitRepository};
use crate::scheduler::EligibilitySelector;
use crate::scheduler::backfill;
use crate::server::AppState;

const MAX_NAME_LENGTH: usize = 255;

fn tenant_list(models: Vec<crate::models::tenant::Model>) -> Json<Vec<TenantResponse>> {
    Json(models.into_iter().map(TenantResponse::from).collect())
}

/// List every tenant
#[utoipa::path(
    get,
    path = "/api/v1/tenants",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "All tenants ordered by priority", body = Vec<TenantResponse>),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn list_tenants(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<Vec<TenantResponse>>, ApiError> {
    let tenants = TenantRepository::new(state.db.clone()).list_all().await?;
    Ok(tenant_list(tenants))
}

/// Onboard a tenant
#[utoipa::path(
    post,
    path = "/api/v1/tenants",
    security(("bearer_auth" = [])),
    request_body = CreateTenantRequest,
    responses(
        (status = 201, description = "Tenant created", body = TenantResponse, headers(
            ("Location", description = "URL of the created tenant")
        )),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 409, description = "A tenant with this name already exists", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn create_tenant(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Json(request): Json<CreateTenantRequest>,
) -> Result<(StatusCode, [(&'static str, String); 1], Json<TenantResponse>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(validation_error(
            "Tenant name is required and cannot be empty",
            serde_json::json!({ "name": "must not be empty" }),
        ));
    }
    if request.name.len() > MAX_NAME_LENGTH {
        return Err(validation_error(
            "Tenant name exceeds maximum length",
            serde_json::json!({
                "name": "too long",
                "max_length": MAX_NAME_LENGTH,
                "actual_length": request.name.len()
            }),
        ));
    }

    let scheduler = &state.config.scheduler;
    let new = NewTenant {
        name: request.name,
        kind: request.kind,
        priority: request.priority.unwrap_or(0),
        max_failures: request.max_failures.unwrap_or(scheduler.default_max_failures),
    };
    let tenant = TenantRepository::new(state.db.clone())
        .create(new, scheduler.backfill_months, scheduler.default_max_retries)
        .await?;

    let location = format!("/api/v1/tenants/{}", tenant.id);
    Ok((
        StatusCode::CREATED,
        [("Location", location)],
        Json(tenant.into()),
    ))
}

/// Tenants the next cycle may select, in selection order
#[utoipa::path(
    get,
    path = "/api/v1/tenants/eligible",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Eligible tenants", body = Vec<TenantResponse>),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn list_eligible_tenants(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<Vec<TenantResponse>>, ApiError> {
    let selector = EligibilitySelector::new(TenantRepository::new(state.db.clone()));
    Ok(tenant_list(selector.list_eligible().await?))
}

/// Tenants with a run in flight
#[utoipa::path(
    get,
    path = "/api/v1/tenants/running",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Running tenants, oldest claim first", body = Vec<TenantResponse>),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn list_running_tenants(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<Vec<TenantResponse>>, ApiError> {
    let tenants = TenantRepository::new(state.db.clone()).list_running().await?;
    Ok(tenant_list(tenants))
}

/// Get a tenant by ID
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{id}",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Tenant UUID")),
    responses(
        (status = 200, description = "Tenant record", body = TenantResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn get_tenant(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantResponse>, ApiError> {
    let tenant = TenantRepository::new(state.db.clone()).get(tenant_id).await?;
    Ok(Json(tenant.into()))
}

/// Dispatch a tenant immediately
///
/// Subject to the same eligibility and deadline rules as a scheduled cycle.
/// The run continues in the background.
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/trigger",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Tenant UUID")),
    responses(
        (status = 202, description = "Dispatch accepted", body = TriggerResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError),
        (status = 409, description = "Tenant not eligible or nothing to dispatch", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn trigger_tenant(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(tenant_id): Path<Uuid>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let accepted = state.orchestrator.trigger(tenant_id).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted.into())))
}

/// Reset failure state and make the tenant runnable again
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/reset",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Tenant UUID")),
    responses(
        (status = 200, description = "Tenant after reset", body = TenantResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn reset_tenant(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantResponse>, ApiError> {
    let tenant = TenantRepository::new(state.db.clone()).reset(tenant_id).await?;
    Ok(Json(tenant.into()))
}

/// Activate a tenant (also re-enables it and clears its failure counter)
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/activate",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Tenant UUID")),
    responses(
        (status = 200, description = "Activated tenant", body = TenantResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn activate_tenant(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantResponse>, ApiError> {
    let tenant = TenantRepository::new(state.db.clone())
        .activate(tenant_id)
        .await?;
    Ok(Json(tenant.into()))
}

/// Deactivate a tenant
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/deactivate",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Tenant UUID")),
    responses(
        (status = 200, description = "Deactivated tenant", body = TenantResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn deactivate_tenant(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantResponse>, ApiError> {
    let tenant = TenantRepository::new(state.db.clone())
        .deactivate(tenant_id)
        .await?;
    Ok(Json(tenant.into()))
}

/// Restart a tenant as new, rebuilding its backfill window
#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/convert-to-new",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Tenant UUID")),
    responses(
        (status = 200, description = "Tenant with a fresh backfill window", body = TenantResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError),
        (status = 409, description = "Tenant has a run in flight", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn convert_to_new(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantResponse>, ApiError> {
    let scheduler = &state.config.scheduler;
    let tenant = TenantRepository::new(state.db.clone())
        .convert_to_new(
            tenant_id,
            scheduler.backfill_months,
            scheduler.default_max_retries,
        )
        .await?;
    Ok(Json(tenant.into()))
}

/// Backfill progress of a tenant
#[utoipa::path(
    get,
    path = "/api/v1/tenants/{id}/backfill-progress",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Tenant UUID")),
    responses(
        (status = 200, description = "Backfill progress", body = BackfillProgressResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Tenant not found", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn backfill_progress(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<BackfillProgressResponse>, ApiError> {
    let tenant = TenantRepository::new(state.db.clone()).get(tenant_id).await?;
    let units = WorkUnitRepository::new(state.db.clone())
        .list_for_tenant(tenant_id)
        .await?;

    let progress = backfill::summarize(&tenant, &units, Period::current());
    Ok(Json(BackfillProgressResponse::new(tenant, progress)))
}

//! # Server Configuration
//!
//! Router, shared state and process runtime for the orchestrator: the admin
//! API, the configured orchestrator loop and the reaper loop share one
//! cancellation token and stop together.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use url::Url;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::handlers::{self, system, tenants, work_units};
use crate::pipeline::{HttpPipeline, NoopPipeline, Pipeline};
use crate::repositories::{TenantRepository, WorkUnitRepository};
use crate::scheduler::{
    Orchestrator, Reaper, RotationCursor, SchedulerContext, build_orchestrator, run_orchestrator,
};
use crate::telemetry::trace_context_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub reaper: Arc<Reaper>,
}

impl AppState {
    /// Wires the orchestrator selected by `config.scheduler.mode` and the
    /// reaper around one rotation cursor.
    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        pipeline: Arc<dyn Pipeline>,
        shutdown: CancellationToken,
    ) -> Self {
        let scheduler = config.scheduler.clone();
        let cursor = Arc::new(RotationCursor::new());
        let reaper = Arc::new(Reaper::new(
            TenantRepository::new(db.clone()),
            WorkUnitRepository::new(db.clone()),
            Arc::clone(&cursor),
            scheduler.stale_threshold(),
            scheduler.reaper_interval(),
        ));
        let context = SchedulerContext::new(db.clone(), pipeline, scheduler, shutdown);
        let orchestrator = build_orchestrator(context, cursor);

        Self {
            config,
            db,
            orchestrator,
            reaper,
        }
    }
}

/// HTTP pipeline when an endpoint is configured, otherwise the no-op one.
pub fn build_pipeline(config: &AppConfig) -> anyhow::Result<Arc<dyn Pipeline>> {
    match config.pipeline_endpoint.as_deref() {
        Some(endpoint) => {
            let url = Url::parse(endpoint).context("Invalid pipeline endpoint")?;
            let pipeline =
                HttpPipeline::new(url).context("Failed to build pipeline HTTP client")?;
            Ok(Arc::new(pipeline))
        }
        None => {
            info!("No pipeline endpoint configured; runs use the no-op pipeline");
            Ok(Arc::new(NoopPipeline))
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(system::status))
        .route("/stats", get(system::stats))
        .route("/maintenance/reap", post(system::reap))
        .route(
            "/tenants",
            get(tenants::list_tenants).post(tenants::create_tenant),
        )
        .route("/tenants/eligible", get(tenants::list_eligible_tenants))
        .route("/tenants/running", get(tenants::list_running_tenants))
        .route("/tenants/{id}", get(tenants::get_tenant))
        .route("/tenants/{id}/trigger", post(tenants::trigger_tenant))
        .route("/tenants/{id}/reset", post(tenants::reset_tenant))
        .route("/tenants/{id}/activate", post(tenants::activate_tenant))
        .route("/tenants/{id}/deactivate", post(tenants::deactivate_tenant))
        .route("/tenants/{id}/convert-to-new", post(tenants::convert_to_new))
        .route(
            "/tenants/{id}/backfill-progress",
            get(tenants::backfill_progress),
        )
        .route(
            "/tenants/{id}/work-units",
            get(work_units::list_tenant_work_units),
        )
        .route(
            "/tenants/{id}/retry/{period}",
            post(work_units::retry_work_unit),
        )
        .route(
            "/work-units/running",
            get(work_units::list_running_work_units),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .nest("/api/v1", api)
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Runs the admin API, the orchestrator and the reaper until Ctrl-C.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let addr = config.bind_addr().context("Invalid server address")?;
    let pipeline = build_pipeline(&config)?;
    let shutdown = CancellationToken::new();
    let state = AppState::new(Arc::new(config), db, pipeline, shutdown.clone());

    let orchestrator_task = tokio::spawn(run_orchestrator(
        Arc::clone(&state.orchestrator),
        shutdown.clone(),
    ));
    let reaper_task = tokio::spawn(Arc::clone(&state.reaper).run(shutdown.clone()));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_token.cancel();
            }
            Err(err) => error!(error = %err, "Failed to listen for shutdown signal"),
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        %addr,
        profile = %state.config.profile,
        strategy = %state.orchestrator.strategy(),
        "Server listening"
    );

    let app = create_app(state);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    for (name, task) in [("orchestrator", orchestrator_task), ("reaper", reaper_task)] {
        if let Err(err) = task.await {
            error!(task = name, error = %err, "Background loop ended abnormally");
        }
    }

    served.context("HTTP server error")
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::system::status,
        crate::handlers::system::stats,
        crate::handlers::system::reap,
        crate::handlers::tenants::list_tenants,
        crate::handlers::tenants::create_tenant,
        crate::handlers::tenants::list_eligible_tenants,
        crate::handlers::tenants::list_running_tenants,
        crate::handlers::tenants::get_tenant,
        crate::handlers::tenants::trigger_tenant,
        crate::handlers::tenants::reset_tenant,
        crate::handlers::tenants::activate_tenant,
        crate::handlers::tenants::deactivate_tenant,
        crate::handlers::tenants::convert_to_new,
        crate::handlers::tenants::backfill_progress,
        crate::handlers::work_units::list_tenant_work_units,
        crate::handlers::work_units::retry_work_unit,
        crate::handlers::work_units::list_running_work_units,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::models::tenant::TenantStatus,
            crate::models::tenant::TenantKind,
            crate::models::tenant::RunStatus,
            crate::models::work_unit::WorkUnitStatus,
            crate::handlers::types::TenantResponse,
            crate::handlers::types::WorkUnitResponse,
            crate::handlers::types::CreateTenantRequest,
            crate::handlers::types::BackfillProgressResponse,
            crate::handlers::types::TriggerResponse,
            crate::handlers::types::StatusResponse,
            crate::handlers::types::StatsResponse,
            crate::handlers::types::TenantStats,
            crate::handlers::types::WorkUnitStats,
            crate::handlers::types::ReapResponse,
            crate::handlers::types::HealthResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "tenants", description = "Tenant registry and operator controls"),
        (name = "work-units", description = "Work-unit ledger"),
        (name = "system", description = "Scheduler status and maintenance"),
    ),
    info(
        title = "Batch Orchestrator API",
        description = "Admin API for the multi-tenant batch orchestrator",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

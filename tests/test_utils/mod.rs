//! Test utilities for database and scheduler testing.
//!
//! In-memory SQLite databases with migrations applied, scripted pipeline
//! fakes, and helpers that age claims so stale-run paths can be exercised
//! without waiting.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use batch_orchestrator::config::{SchedulerConfig, SchedulerMode};
use batch_orchestrator::models::{tenant, work_unit};
use batch_orchestrator::pipeline::{Pipeline, PipelineError, PipelineOutcome, PipelineRequest};
use batch_orchestrator::repositories::{NewTenant, TenantRepository};
use batch_orchestrator::scheduler::SchedulerContext;
use chrono::{Duration as ChronoDuration, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Scheduler settings with short timings for tests.
pub fn test_scheduler_config(mode: SchedulerMode) -> SchedulerConfig {
    SchedulerConfig {
        mode,
        round_robin_interval_seconds: 1,
        dispatch_timeout_seconds: 1,
        parallel_interval_seconds: 1,
        max_concurrent_jobs: 4,
        reaper_interval_seconds: 1,
        stale_threshold_seconds: 60,
        backfill_months: 24,
        default_max_failures: 3,
        default_max_retries: 3,
    }
}

pub fn test_context(
    db: &DatabaseConnection,
    pipeline: Arc<dyn Pipeline>,
    mode: SchedulerMode,
) -> SchedulerContext {
    SchedulerContext::new(
        db.clone(),
        pipeline,
        test_scheduler_config(mode),
        CancellationToken::new(),
    )
}

/// Onboards a tenant through the repository.
pub async fn create_tenant(
    db: &DatabaseConnection,
    name: &str,
    kind: tenant::TenantKind,
    priority: i32,
) -> Result<tenant::Model> {
    let tenant = TenantRepository::new(db.clone())
        .create(
            NewTenant {
                name: name.to_string(),
                kind,
                priority,
                max_failures: 3,
            },
            24,
            3,
        )
        .await?;
    Ok(tenant)
}

/// Moves a tenant's claim timestamp into the past.
pub async fn age_tenant_claim(db: &DatabaseConnection, id: Uuid, seconds: i64) -> Result<()> {
    let started = Utc::now().fixed_offset() - ChronoDuration::seconds(seconds);
    tenant::Entity::update_many()
        .col_expr(tenant::Column::RunStartedAt, Expr::value(started))
        .filter(tenant::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// Moves a work unit's start timestamp into the past.
pub async fn age_work_unit(db: &DatabaseConnection, id: Uuid, seconds: i64) -> Result<()> {
    let started = Utc::now().fixed_offset() - ChronoDuration::seconds(seconds);
    work_unit::Entity::update_many()
        .col_expr(work_unit::Column::StartedAt, Expr::value(started))
        .filter(work_unit::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

/// How the scripted pipeline answers for one tenant.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed(u64),
    Fail(String),
    /// Never finishes on its own; only cancellation ends the run
    Hang,
    /// Sleeps, then succeeds, ignoring cancellation
    SlowSucceed(Duration),
}

/// Pipeline fake that records every request and answers per tenant.
#[derive(Default)]
pub struct ScriptedPipeline {
    scripts: Mutex<HashMap<Uuid, Script>>,
    calls: Mutex<Vec<PipelineRequest>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedPipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, tenant_id: Uuid, script: Script) {
        self.scripts.lock().unwrap().insert(tenant_id, script);
    }

    pub fn calls(&self) -> Vec<PipelineRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tenants_called(&self) -> Vec<Uuid> {
        self.calls().into_iter().map(|call| call.tenant_id).collect()
    }

    /// Highest number of runs observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    async fn run(
        &self,
        request: PipelineRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.tenant_id)
            .cloned()
            .unwrap_or(Script::Succeed(1));
        self.calls.lock().unwrap().push(request);

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);

        let result = match script {
            Script::Succeed(processed) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(PipelineOutcome {
                    processed,
                    failed: 0,
                })
            }
            Script::Fail(message) => Err(PipelineError::permanent(message).with_counts(2, 1)),
            Script::Hang => {
                cancel.cancelled().await;
                Err(PipelineError::cancelled())
            }
            Script::SlowSucceed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(PipelineOutcome {
                    processed: 7,
                    failed: 0,
                })
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

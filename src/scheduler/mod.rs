//! # Scheduler
//!
//! Multi-tenant orchestration of the shared pipeline. Two interchangeable
//! strategies implement [`Orchestrator`]: single-slot round-robin and
//! parallel fan-out. Exactly one runs per process, next to the [`Reaper`]
//! that reclaims runs left in flight by a crash.
//!
//! Every dispatch carries the attempt token handed out when the tenant (and
//! work unit) were claimed. Completion handlers apply only while that token
//! is still live, so a late result from a timed-out or reclaimed run is
//! discarded instead of overwriting newer state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{SchedulerConfig, SchedulerMode};
use crate::error::RepositoryError;
use crate::models::tenant::Model as Tenant;
use crate::period::Period;
use crate::pipeline::{Pipeline, PipelineErrorKind};
use crate::repositories::{Reconciled, TenantRepository, WorkUnitRepository};
use crate::telemetry::{CYCLE_DURATION_MS, DISPATCH_TOTAL};

pub mod backfill;
pub mod dispatch;
pub mod eligibility;
pub mod parallel;
pub mod reaper;
pub mod rotation;
pub mod round_robin;

pub use eligibility::EligibilitySelector;
pub use parallel::ParallelOrchestrator;
pub use reaper::{ReapReport, Reaper};
pub use rotation::RotationCursor;
pub use round_robin::RoundRobinOrchestrator;

use dispatch::DispatchResult;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("tenant {0} not found")]
    TenantNotFound(Uuid),
    #[error("tenant {0} is not eligible to run")]
    NotEligible(Uuid),
    #[error("tenant {0} has no work unit that can be dispatched")]
    NothingToDispatch(Uuid),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Final state of one pipeline run after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded { processed: u64 },
    Failed { cause: String },
    TimedOut,
    /// The run's token was no longer live; its result was dropped
    Discarded,
    /// Shutdown cancelled the run; the claim was released without a failure
    Interrupted,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded { .. } => "success",
            RunOutcome::Failed { .. } => "failure",
            RunOutcome::TimedOut => "timeout",
            RunOutcome::Discarded => "discarded",
            RunOutcome::Interrupted => "interrupted",
        }
    }
}

/// Per-cycle summary of the parallel strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub considered: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// What one scheduling cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was eligible
    Idle,
    /// The selected tenant was claimed by someone else first
    Contended { tenant_id: Uuid },
    /// Single-slot dispatch ran to a reconciled outcome
    Dispatched { tenant_id: Uuid, outcome: RunOutcome },
    /// Parallel fan-out; runs reconcile in the background
    Fanout(FanoutReport),
}

/// An accepted out-of-band trigger. The run continues in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerAccepted {
    pub tenant_id: Uuid,
    /// Token of the new claim; `None` while the run waits for a worker
    pub attempt: Option<i32>,
    pub period: Option<Period>,
}

/// A scheduling strategy.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn strategy(&self) -> SchedulerMode;

    /// Pause between two cycles.
    fn interval(&self) -> Duration;

    /// Runs one cycle. Failures of individual runs are recorded on the
    /// tenant, never returned.
    async fn select_and_dispatch(&self) -> Result<CycleOutcome, SchedulerError>;

    /// Dispatches one tenant now, under the same eligibility and deadline
    /// rules as a cycle.
    async fn trigger(&self, tenant_id: Uuid) -> Result<TriggerAccepted, SchedulerError>;

    /// Waits for every background run started so far.
    async fn drain(&self);
}

/// Collaborators shared by both strategies.
#[derive(Clone)]
pub struct SchedulerContext {
    pub tenants: TenantRepository,
    pub work_units: WorkUnitRepository,
    pub pipeline: Arc<dyn Pipeline>,
    pub config: SchedulerConfig,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

impl SchedulerContext {
    pub fn new(
        db: DatabaseConnection,
        pipeline: Arc<dyn Pipeline>,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tenants: TenantRepository::new(db.clone()),
            work_units: WorkUnitRepository::new(db),
            pipeline,
            config,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    /// Waits for tracked background runs, then accepts new ones again.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Loads a tenant, mapping absence to [`SchedulerError::TenantNotFound`].
    pub(crate) async fn load_tenant(&self, tenant_id: Uuid) -> Result<Tenant, SchedulerError> {
        self.tenants
            .find(tenant_id)
            .await?
            .ok_or(SchedulerError::TenantNotFound(tenant_id))
    }

    /// Turns a dispatch result into a tenant transition guarded by the
    /// claim's attempt token.
    pub(crate) async fn reconcile_tenant(
        &self,
        tenant: &Tenant,
        result: &DispatchResult,
    ) -> RunOutcome {
        let outcome = self.classify(result);
        let recorded = match &outcome {
            RunOutcome::Succeeded { .. } => {
                self.tenants.record_success(tenant.id, tenant.attempt).await
            }
            RunOutcome::Failed { cause } => {
                self.tenants
                    .record_failure(tenant.id, tenant.attempt, cause)
                    .await
            }
            RunOutcome::TimedOut => {
                let cause = self.timeout_cause();
                self.tenants
                    .record_failure(tenant.id, tenant.attempt, &cause)
                    .await
            }
            RunOutcome::Interrupted => self.tenants.release_claim(tenant.id, tenant.attempt).await,
            RunOutcome::Discarded => return RunOutcome::Discarded,
        };

        match recorded {
            Ok(Reconciled::Applied(_)) => outcome,
            Ok(Reconciled::Discarded) => {
                info!(
                    tenant_id = %tenant.id,
                    attempt = tenant.attempt,
                    result = outcome.label(),
                    "Late run result discarded; claim no longer live"
                );
                RunOutcome::Discarded
            }
            Err(err) => {
                // Left running; the reaper reclaims it.
                error!(tenant_id = %tenant.id, error = %err, "Failed to record run outcome");
                outcome
            }
        }
    }

    pub(crate) fn classify(&self, result: &DispatchResult) -> RunOutcome {
        match result {
            DispatchResult::Finished(Ok(outcome)) => RunOutcome::Succeeded {
                processed: outcome.processed,
            },
            DispatchResult::Finished(Err(err))
                if err.kind == PipelineErrorKind::Cancelled && self.shutdown.is_cancelled() =>
            {
                RunOutcome::Interrupted
            }
            DispatchResult::Finished(Err(err)) => RunOutcome::Failed {
                cause: err.to_string(),
            },
            DispatchResult::TimedOut => RunOutcome::TimedOut,
        }
    }

    pub(crate) fn timeout_cause(&self) -> String {
        format!(
            "dispatch timed out after {}s",
            self.config.dispatch_timeout_seconds
        )
    }
}

/// Counts one reconciled run.
pub(crate) fn record_dispatch(strategy: SchedulerMode, outcome: &RunOutcome) {
    counter!(
        DISPATCH_TOTAL,
        "strategy" => strategy.as_str(),
        "outcome" => outcome.label()
    )
    .increment(1);
}

/// Builds the orchestrator selected by `config.mode`.
pub fn build_orchestrator(
    context: SchedulerContext,
    cursor: Arc<RotationCursor>,
) -> Arc<dyn Orchestrator> {
    match context.config.mode {
        SchedulerMode::RoundRobin => Arc::new(RoundRobinOrchestrator::new(context, cursor)),
        SchedulerMode::Parallel => Arc::new(ParallelOrchestrator::new(context)),
    }
}

/// Drives `orchestrator` every interval until `shutdown` fires. A failed
/// cycle is logged and the next one runs on schedule.
#[instrument(skip_all, fields(strategy = %orchestrator.strategy()))]
pub async fn run_orchestrator(orchestrator: Arc<dyn Orchestrator>, shutdown: CancellationToken) {
    let interval = orchestrator.interval();
    let strategy = orchestrator.strategy();
    info!(interval_secs = interval.as_secs(), "Starting orchestrator");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Orchestrator shutdown requested");
                break;
            }
            _ = sleep(interval) => {
                let cycle_started = Instant::now();
                match orchestrator.select_and_dispatch().await {
                    Ok(CycleOutcome::Idle) => debug!("No eligible tenants this cycle"),
                    Ok(outcome) => debug!(?outcome, "Orchestrator cycle completed"),
                    Err(err) => error!(error = %err, "Orchestrator cycle failed"),
                }
                histogram!(CYCLE_DURATION_MS, "strategy" => strategy.as_str())
                    .record(cycle_started.elapsed().as_secs_f64() * 1_000.0);
            }
        }
    }

    if tokio::time::timeout(Duration::from_secs(30), orchestrator.drain())
        .await
        .is_err()
    {
        warn!("In-flight runs still active after shutdown grace period");
    }
    info!("Orchestrator stopped");
}

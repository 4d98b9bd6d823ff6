//! Parallel fan-out strategy.
//!
//! Every cycle walks all active, enabled tenants and queues each one that is
//! eligible and has a dispatchable work unit: the current period for
//! existing tenants, the next backfill period for new ones. At most
//! `max_concurrent_jobs` runs execute at a time. A queued tenant is claimed
//! and its unit started only once a worker permit is granted, so time spent
//! waiting in the queue never looks like a stale run to the reaper.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use metrics::gauge;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backfill::{BackfillStep, PeriodPlan, plan_backfill, plan_period};
use super::dispatch::{DispatchResult, dispatch_with_deadline};
use super::{
    CycleOutcome, FanoutReport, Orchestrator, RunOutcome, SchedulerContext, SchedulerError,
    TriggerAccepted, record_dispatch,
};
use crate::config::SchedulerMode;
use crate::models::tenant::Model as Tenant;
use crate::models::work_unit::Model as WorkUnit;
use crate::period::Period;
use crate::pipeline::PipelineRequest;
use crate::repositories::Reconciled;
use crate::telemetry::INFLIGHT_JOBS;

/// A claimed tenant paired with the unit it will process.
struct Job {
    tenant: Tenant,
    unit: WorkUnit,
    period: Period,
}

type QueuedTenants = Arc<Mutex<HashSet<Uuid>>>;

/// Marks a tenant as waiting for a worker; unmarked on drop.
struct QueueSlot {
    queued: QueuedTenants,
    tenant_id: Uuid,
}

impl QueueSlot {
    fn take(queued: &QueuedTenants, tenant_id: Uuid) -> Option<Self> {
        lock(queued).insert(tenant_id).then(|| Self {
            queued: Arc::clone(queued),
            tenant_id,
        })
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        lock(&self.queued).remove(&self.tenant_id);
    }
}

fn lock(queued: &QueuedTenants) -> MutexGuard<'_, HashSet<Uuid>> {
    queued.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[derive(Clone)]
pub struct ParallelOrchestrator {
    context: SchedulerContext,
    permits: Arc<Semaphore>,
    queued: QueuedTenants,
}

impl ParallelOrchestrator {
    pub fn new(context: SchedulerContext) -> Self {
        let permits = Arc::new(Semaphore::new(context.config.max_concurrent_jobs));
        Self {
            context,
            permits,
            queued: Arc::default(),
        }
    }

    fn is_queued(&self, tenant_id: Uuid) -> bool {
        lock(&self.queued).contains(&tenant_id)
    }

    /// The period `tenant` should process next, if any is dispatchable.
    async fn target_period(
        &self,
        tenant: &Tenant,
        current: Period,
    ) -> Result<Option<Period>, SchedulerError> {
        if let (true, Some(start)) = (tenant.needs_backfill(), tenant.backfill_start()) {
            let units = self.context.work_units.list_for_tenant(tenant.id).await?;
            return match plan_backfill(start, current, &units) {
                BackfillStep::Dispatch(period) => Ok(Some(period)),
                BackfillStep::Blocked(period, plan) => {
                    if plan == PeriodPlan::Exhausted {
                        warn!(
                            tenant_id = %tenant.id,
                            %period,
                            "Backfill blocked on a period with no retries left"
                        );
                    }
                    Ok(None)
                }
                BackfillStep::Complete => {
                    self.context.tenants.complete_backfill(tenant.id).await?;
                    Ok(None)
                }
            };
        }

        let unit = self.context.work_units.find(tenant.id, current).await?;
        Ok(match plan_period(unit.as_ref()) {
            PeriodPlan::Dispatch => Some(current),
            _ => None,
        })
    }

    /// Claims the tenant and puts its target unit in flight. `Ok(None)` when
    /// there is nothing to run or another dispatcher got there first.
    async fn prepare(&self, tenant: &Tenant, current: Period) -> Result<Option<Job>, SchedulerError> {
        let Some(period) = self.target_period(tenant, current).await? else {
            return Ok(None);
        };
        let Some(claimed) = self.context.tenants.try_mark_running(tenant.id).await? else {
            return Ok(None);
        };

        let begun = self
            .context
            .work_units
            .begin(claimed.id, period, self.context.config.default_max_retries)
            .await;

        match begun {
            Ok(Some(unit)) => Ok(Some(Job {
                tenant: claimed,
                unit,
                period,
            })),
            Ok(None) => {
                self.context
                    .tenants
                    .release_claim(claimed.id, claimed.attempt)
                    .await?;
                Ok(None)
            }
            Err(err) => {
                if let Err(release_err) = self
                    .context
                    .tenants
                    .release_claim(claimed.id, claimed.attempt)
                    .await
                {
                    error!(tenant_id = %claimed.id, error = %release_err, "Failed to release claim");
                }
                Err(err.into())
            }
        }
    }

    /// Reloads a queued tenant once it holds a permit and claims it if it is
    /// still eligible.
    async fn claim_queued(&self, tenant_id: Uuid) -> Result<Option<Job>, SchedulerError> {
        let Some(tenant) = self.context.tenants.find(tenant_id).await? else {
            return Ok(None);
        };
        if !tenant.is_eligible() {
            return Ok(None);
        }
        self.prepare(&tenant, Period::current()).await
    }

    /// Queues `tenant_id` for a worker. `false` when it is already queued.
    fn enqueue(&self, tenant_id: Uuid) -> bool {
        let Some(slot) = QueueSlot::take(&self.queued, tenant_id) else {
            return false;
        };

        let this = self.clone();
        self.context.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = this.context.shutdown.cancelled() => None,
                permit = Arc::clone(&this.permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit.filter(|_| !this.context.shutdown.is_cancelled()) else {
                // Nothing claimed yet; the tenant stays as it was.
                debug!(%tenant_id, "Queued run dropped at shutdown");
                return;
            };

            let claimed = this.claim_queued(tenant_id).await;
            drop(slot);
            match claimed {
                Ok(Some(job)) => this.run(job, permit).await,
                Ok(None) => debug!(%tenant_id, "Queued tenant no longer dispatchable"),
                Err(err) => error!(%tenant_id, error = %err, "Failed to claim queued tenant"),
            }
        });
        true
    }

    fn spawn_claimed(&self, job: Job, permit: OwnedSemaphorePermit) {
        let this = self.clone();
        self.context
            .tracker
            .spawn(async move { this.run(job, permit).await });
    }

    async fn run(&self, job: Job, _permit: OwnedSemaphorePermit) {
        gauge!(INFLIGHT_JOBS).increment(1.0);
        self.execute(job).await;
        gauge!(INFLIGHT_JOBS).decrement(1.0);
    }

    #[instrument(skip_all, fields(tenant_id = %job.tenant.id, period = %job.period))]
    async fn execute(&self, job: Job) -> RunOutcome {
        let request = PipelineRequest {
            tenant_id: job.tenant.id,
            period: Some(job.period),
            attempt: job.unit.attempt,
        };
        let result = dispatch_with_deadline(
            Arc::clone(&self.context.pipeline),
            request,
            self.context.config.dispatch_timeout(),
            &self.context.shutdown,
        )
        .await;

        let outcome = match self.reconcile_unit(&job, &result).await {
            Ok(Reconciled::Applied(_)) => self.reconcile_tenant(&job, &result).await,
            Ok(Reconciled::Discarded) => {
                info!(attempt = job.unit.attempt, "Late work unit result discarded");
                RunOutcome::Discarded
            }
            Err(err) => {
                // Unit stays in flight until the reaper reclaims it.
                error!(error = %err, "Failed to record work unit outcome");
                self.context.classify(&result)
            }
        };

        record_dispatch(SchedulerMode::Parallel, &outcome);
        info!(outcome = outcome.label(), "Work unit run finished");
        outcome
    }

    async fn reconcile_unit(
        &self,
        job: &Job,
        result: &DispatchResult,
    ) -> Result<Reconciled<WorkUnit>, crate::error::RepositoryError> {
        let units = &self.context.work_units;
        let unit = &job.unit;
        match result {
            DispatchResult::Finished(Ok(outcome)) => {
                units
                    .complete(
                        unit.id,
                        unit.attempt,
                        saturating_count(outcome.processed),
                        saturating_count(outcome.failed),
                    )
                    .await
            }
            DispatchResult::Finished(Err(err)) => {
                units
                    .fail(
                        unit.id,
                        unit.attempt,
                        &err.to_string(),
                        saturating_count(err.processed),
                        saturating_count(err.failed),
                    )
                    .await
            }
            DispatchResult::TimedOut => {
                units
                    .fail(unit.id, unit.attempt, &self.context.timeout_cause(), 0, 0)
                    .await
            }
        }
    }

    async fn reconcile_tenant(&self, job: &Job, result: &DispatchResult) -> RunOutcome {
        let outcome = self.context.reconcile_tenant(&job.tenant, result).await;
        if matches!(outcome, RunOutcome::Succeeded { .. }) && job.tenant.needs_backfill() {
            if let Err(err) = self
                .context
                .tenants
                .record_period_completed(job.tenant.id, job.period, Period::current())
                .await
            {
                error!(error = %err, "Failed to advance backfill cursor");
            }
        }
        outcome
    }
}

fn saturating_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl Orchestrator for ParallelOrchestrator {
    fn strategy(&self) -> SchedulerMode {
        SchedulerMode::Parallel
    }

    fn interval(&self) -> Duration {
        self.context.config.parallel_interval()
    }

    async fn select_and_dispatch(&self) -> Result<CycleOutcome, SchedulerError> {
        let candidates = self.context.tenants.list_active_enabled().await?;
        let current = Period::current();
        let mut report = FanoutReport::default();

        for tenant in candidates {
            report.considered += 1;
            if !tenant.is_eligible() {
                report.skipped += 1;
                continue;
            }

            if self.is_queued(tenant.id) {
                report.skipped += 1;
                continue;
            }

            match self.target_period(&tenant, current).await {
                Ok(Some(period)) if self.enqueue(tenant.id) => {
                    debug!(tenant_id = %tenant.id, %period, "Queued work unit");
                    report.dispatched += 1;
                }
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    // One tenant's storage error must not stall the others.
                    error!(tenant_id = %tenant.id, error = %err, "Failed to plan tenant");
                    report.errors += 1;
                }
            }
        }

        if report.dispatched > 0 {
            info!(
                considered = report.considered,
                dispatched = report.dispatched,
                skipped = report.skipped,
                "Parallel cycle dispatched work"
            );
        }
        Ok(CycleOutcome::Fanout(report))
    }

    async fn trigger(&self, tenant_id: Uuid) -> Result<TriggerAccepted, SchedulerError> {
        let tenant = self.context.load_tenant(tenant_id).await?;
        if !tenant.is_eligible() {
            return Err(SchedulerError::NotEligible(tenant_id));
        }

        let current = Period::current();
        let accepted = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                let job = self
                    .prepare(&tenant, current)
                    .await?
                    .ok_or(SchedulerError::NothingToDispatch(tenant_id))?;
                let accepted = TriggerAccepted {
                    tenant_id,
                    attempt: Some(job.tenant.attempt),
                    period: Some(job.period),
                };
                self.spawn_claimed(job, permit);
                accepted
            }
            // Every worker is busy; the claim waits for a permit.
            Err(_) => {
                let period = self
                    .target_period(&tenant, current)
                    .await?
                    .ok_or(SchedulerError::NothingToDispatch(tenant_id))?;
                if !self.enqueue(tenant_id) {
                    return Err(SchedulerError::NotEligible(tenant_id));
                }
                TriggerAccepted {
                    tenant_id,
                    attempt: None,
                    period: Some(period),
                }
            }
        };

        info!(%tenant_id, period = ?accepted.period, "Manual run triggered");
        Ok(accepted)
    }

    async fn drain(&self) {
        self.context.drain().await;
    }
}

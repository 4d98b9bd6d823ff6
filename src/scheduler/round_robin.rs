//! Single-slot round-robin strategy.
//!
//! Each cycle picks exactly one eligible tenant at the rotation cursor,
//! claims it, and dispatches a full-tenant run bounded by the dispatch
//! deadline. Work units are not consulted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::dispatch::dispatch_with_deadline;
use super::{
    CycleOutcome, EligibilitySelector, Orchestrator, RotationCursor, RunOutcome,
    SchedulerContext, SchedulerError, TriggerAccepted, record_dispatch,
};
use crate::config::SchedulerMode;
use crate::models::tenant::Model as Tenant;
use crate::pipeline::PipelineRequest;

pub struct RoundRobinOrchestrator {
    context: SchedulerContext,
    selector: EligibilitySelector,
    cursor: Arc<RotationCursor>,
}

impl RoundRobinOrchestrator {
    pub fn new(context: SchedulerContext, cursor: Arc<RotationCursor>) -> Self {
        let selector = EligibilitySelector::new(context.tenants.clone());
        Self {
            context,
            selector,
            cursor,
        }
    }

    /// Dispatches a claimed tenant and reconciles the result.
    #[instrument(skip_all, fields(tenant_id = %tenant.id, attempt = tenant.attempt))]
    async fn execute(context: &SchedulerContext, tenant: Tenant) -> RunOutcome {
        let request = PipelineRequest {
            tenant_id: tenant.id,
            period: None,
            attempt: tenant.attempt,
        };
        let result = dispatch_with_deadline(
            Arc::clone(&context.pipeline),
            request,
            context.config.dispatch_timeout(),
            &context.shutdown,
        )
        .await;

        let outcome = context.reconcile_tenant(&tenant, &result).await;
        record_dispatch(SchedulerMode::RoundRobin, &outcome);
        info!(outcome = outcome.label(), "Tenant run finished");
        outcome
    }
}

#[async_trait]
impl Orchestrator for RoundRobinOrchestrator {
    fn strategy(&self) -> SchedulerMode {
        SchedulerMode::RoundRobin
    }

    fn interval(&self) -> Duration {
        self.context.config.round_robin_interval()
    }

    async fn select_and_dispatch(&self) -> Result<CycleOutcome, SchedulerError> {
        let eligible = self.selector.list_eligible().await?;
        let Some(selected) = self
            .cursor
            .next(eligible.len())
            .and_then(|index| eligible.get(index))
        else {
            return Ok(CycleOutcome::Idle);
        };

        let Some(claimed) = self.context.tenants.try_mark_running(selected.id).await? else {
            debug!(tenant_id = %selected.id, "Selected tenant was claimed elsewhere");
            return Ok(CycleOutcome::Contended {
                tenant_id: selected.id,
            });
        };

        let tenant_id = claimed.id;
        let outcome = Self::execute(&self.context, claimed).await;
        Ok(CycleOutcome::Dispatched { tenant_id, outcome })
    }

    async fn trigger(&self, tenant_id: Uuid) -> Result<TriggerAccepted, SchedulerError> {
        let tenant = self.context.load_tenant(tenant_id).await?;
        if !tenant.is_eligible() {
            return Err(SchedulerError::NotEligible(tenant_id));
        }
        let claimed = self
            .context
            .tenants
            .try_mark_running(tenant_id)
            .await?
            .ok_or(SchedulerError::NotEligible(tenant_id))?;

        let accepted = TriggerAccepted {
            tenant_id,
            attempt: Some(claimed.attempt),
            period: None,
        };
        let claimed_attempt = claimed.attempt;
        let context = self.context.clone();
        self.context.tracker.spawn(async move {
            Self::execute(&context, claimed).await;
        });

        info!(%tenant_id, attempt = claimed_attempt, "Manual run triggered");
        Ok(accepted)
    }

    async fn drain(&self) {
        self.context.drain().await;
    }
}

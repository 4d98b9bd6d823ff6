//! # Reaper
//!
//! Periodic sweep that reclaims runs whose claim outlived the stale
//! threshold. A stale work unit is forced to `failed` and the tenant's live
//! claim is charged one failure; a stale running tenant without such a unit
//! is charged the same way. A tenant with no claim is never charged, so an
//! orphaned unit cannot push an idle tenant toward auto-disable. Sweeps
//! repeat harmlessly: every transition is re-checked under the row lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use metrics::counter;
use sea_orm::prelude::DateTimeWithTimeZone;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::RotationCursor;
use crate::error::RepositoryError;
use crate::models::work_unit::STALE_ERROR_MESSAGE;
use crate::repositories::{Reconciled, TenantRepository, WorkUnitRepository};
use crate::telemetry::REAPER_RECLAIMED_TOTAL;

/// What one sweep reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub units_failed: u64,
    pub tenants_failed: u64,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.units_failed == 0 && self.tenants_failed == 0
    }
}

pub struct Reaper {
    tenants: TenantRepository,
    work_units: WorkUnitRepository,
    cursor: Arc<RotationCursor>,
    stale_threshold: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        tenants: TenantRepository,
        work_units: WorkUnitRepository,
        cursor: Arc<RotationCursor>,
        stale_threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            tenants,
            work_units,
            cursor,
            stale_threshold,
            interval,
        }
    }

    /// Reclaims everything stale right now.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> Result<ReapReport, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let Some(cutoff) = stale_cutoff(now, self.stale_threshold) else {
            warn!(
                threshold_secs = self.stale_threshold.as_secs(),
                "Stale threshold out of range; sweep skipped"
            );
            return Ok(ReapReport::default());
        };

        let mut report = ReapReport::default();
        let mut charged: HashSet<Uuid> = HashSet::new();

        for unit in self.work_units.list_stale(cutoff).await? {
            match self.work_units.reap(unit.id, cutoff).await {
                Ok(Reconciled::Applied(reaped)) => {
                    report.units_failed += 1;
                    counter!(REAPER_RECLAIMED_TOTAL, "kind" => "work_unit").increment(1);
                    warn!(
                        tenant_id = %reaped.tenant_id,
                        period = %reaped.period,
                        "Reclaimed stale work unit"
                    );
                    if !charged.contains(&reaped.tenant_id) {
                        self.charge_owner(reaped.tenant_id, &mut charged, &mut report)
                            .await;
                    }
                }
                Ok(Reconciled::Discarded) => {}
                Err(err) => error!(work_unit_id = %unit.id, error = %err, "Failed to reap work unit"),
            }
        }

        for tenant in self.tenants.list_stale_running(cutoff).await? {
            if charged.insert(tenant.id) {
                self.charge(tenant.id, tenant.attempt, &mut report).await;
            }
        }

        if report.tenants_failed > 0 {
            // Reclaimed tenants change the eligible set.
            self.cursor.reset();
        }
        if !report.is_empty() {
            info!(
                units_failed = report.units_failed,
                tenants_failed = report.tenants_failed,
                "Reaper sweep reclaimed stale runs"
            );
        }
        Ok(report)
    }

    /// Charges the owner of a reaped unit if it still holds a claim.
    async fn charge_owner(
        &self,
        tenant_id: Uuid,
        charged: &mut HashSet<Uuid>,
        report: &mut ReapReport,
    ) {
        match self.tenants.find(tenant_id).await {
            Ok(Some(tenant)) if tenant.is_running() => {
                charged.insert(tenant_id);
                self.charge(tenant_id, tenant.attempt, report).await;
            }
            Ok(_) => debug!(%tenant_id, "Reaped unit's tenant holds no claim; not charged"),
            Err(err) => error!(%tenant_id, error = %err, "Failed to load tenant of reaped unit"),
        }
    }

    async fn charge(&self, tenant_id: Uuid, attempt: i32, report: &mut ReapReport) {
        match self
            .tenants
            .record_failure(tenant_id, attempt, STALE_ERROR_MESSAGE)
            .await
        {
            Ok(Reconciled::Applied(_)) => {
                report.tenants_failed += 1;
                counter!(REAPER_RECLAIMED_TOTAL, "kind" => "tenant").increment(1);
            }
            Ok(Reconciled::Discarded) => {}
            Err(err) => error!(%tenant_id, error = %err, "Failed to reclaim tenant"),
        }
    }

    /// Sweeps every interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            stale_threshold_secs = self.stale_threshold.as_secs(),
            "Starting reaper"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reaper shutdown requested");
                    break;
                }
                _ = sleep(self.interval) => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "Reaper sweep failed");
                    }
                }
            }
        }
    }
}

/// `now - threshold`, or `None` when the threshold does not fit a timestamp.
fn stale_cutoff(now: DateTimeWithTimeZone, threshold: Duration) -> Option<DateTimeWithTimeZone> {
    let delta = TimeDelta::from_std(threshold).ok()?;
    now.checked_sub_signed(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_subtracts_threshold() {
        let now = Utc::now().fixed_offset();
        let cutoff = stale_cutoff(now, Duration::from_secs(600)).unwrap();
        assert_eq!(now - cutoff, TimeDelta::seconds(600));
    }

    #[test]
    fn absurd_threshold_yields_no_cutoff() {
        let now = Utc::now().fixed_offset();
        assert!(stale_cutoff(now, Duration::from_secs(u64::MAX)).is_none());
    }
}

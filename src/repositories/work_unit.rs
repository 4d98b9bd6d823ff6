//! # Work Unit Repository
//!
//! Data access for the work-unit ledger. Like the tenant repository, each
//! transition locks one row inside a transaction and lets the pure state
//! machine on [`Model`] decide the change.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RepositoryError, is_unique_violation};
use crate::models::work_unit::{
    Column, Entity, Model, STALE_ERROR_MESSAGE, WorkUnitError, WorkUnitStatus,
};
use crate::period::Period;
use crate::repositories::Reconciled;

/// Per-status counts across the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.retrying
    }
}

/// Repository for work-unit ledger operations
#[derive(Clone)]
pub struct WorkUnitRepository {
    db: DatabaseConnection,
}

impl WorkUnitRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find(
        &self,
        tenant_id: Uuid,
        period: Period,
    ) -> Result<Option<Model>, RepositoryError> {
        Ok(Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Period.eq(period.to_string()))
            .one(&self.db)
            .await?)
    }

    /// The tenant's ledger in chronological order.
    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Model>, RepositoryError> {
        Ok(Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .order_by_asc(Column::Period)
            .all(&self.db)
            .await?)
    }

    /// Units `running` or `retrying` across all tenants, including retries
    /// still waiting for a dispatch.
    pub async fn list_running(&self) -> Result<Vec<Model>, RepositoryError> {
        Ok(Entity::find()
            .filter(Column::Status.is_in([WorkUnitStatus::Running, WorkUnitStatus::Retrying]))
            .order_by_asc(Column::StartedAt)
            .all(&self.db)
            .await?)
    }

    /// In-flight units whose run began before `cutoff`. Retries waiting for
    /// a dispatch carry no `started_at` and are never stale.
    pub async fn list_stale(
        &self,
        cutoff: DateTimeWithTimeZone,
    ) -> Result<Vec<Model>, RepositoryError> {
        Ok(Entity::find()
            .filter(Column::Status.is_in([WorkUnitStatus::Running, WorkUnitStatus::Retrying]))
            .filter(Column::StartedAt.lt(cutoff))
            .order_by_asc(Column::StartedAt)
            .all(&self.db)
            .await?)
    }

    /// Puts the (tenant, period) unit in flight for a new dispatch, creating
    /// it when missing. Returns `None` when the unit must not be dispatched:
    /// already in flight, completed, or out of retries.
    pub async fn begin(
        &self,
        tenant_id: Uuid,
        period: Period,
        max_retries: i32,
    ) -> Result<Option<Model>, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let existing = Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Period.eq(period.to_string()))
            .lock_exclusive()
            .one(&txn)
            .await?;

        let Some(mut unit) = existing else {
            let mut unit = Model::new_pending(tenant_id, period, max_retries, now);
            if unit.start_processing(now).is_err() {
                return Ok(None);
            }
            return match unit.into_active_model().reset_all().insert(&txn).await {
                Ok(created) => {
                    txn.commit().await?;
                    debug!(%tenant_id, %period, attempt = created.attempt, "Work unit created");
                    Ok(Some(created))
                }
                // Lost a creation race; the winner owns this period.
                Err(err) if is_unique_violation(&err) => Ok(None),
                Err(err) => Err(err.into()),
            };
        };

        let started = match unit.status {
            WorkUnitStatus::Pending => unit.start_processing(now).is_ok(),
            WorkUnitStatus::Failed if unit.can_retry() => {
                unit.prepare_retry(now).is_ok() && {
                    unit.resume(now);
                    true
                }
            }
            WorkUnitStatus::Retrying if unit.awaiting_dispatch() => {
                unit.resume(now);
                true
            }
            WorkUnitStatus::Running
            | WorkUnitStatus::Retrying
            | WorkUnitStatus::Completed
            | WorkUnitStatus::Failed => false,
        };

        if !started {
            txn.commit().await?;
            return Ok(None);
        }

        let updated = unit.into_active_model().reset_all().update(&txn).await?;
        txn.commit().await?;
        debug!(
            %tenant_id,
            %period,
            attempt = updated.attempt,
            retry_count = updated.retry_count,
            "Work unit started"
        );
        Ok(Some(updated))
    }

    /// Marks the unit completed if `attempt` is still its live dispatch.
    pub async fn complete(
        &self,
        id: Uuid,
        attempt: i32,
        processed: i64,
        failed: i64,
    ) -> Result<Reconciled<Model>, RepositoryError> {
        let now = Utc::now().fixed_offset();
        self.mutate(id, |unit| {
            unit.is_processing()
                && unit.attempt == attempt
                && unit.complete_processing(processed, failed, now).is_ok()
        })
        .await
    }

    /// Marks the unit failed if `attempt` is still its live dispatch.
    pub async fn fail(
        &self,
        id: Uuid,
        attempt: i32,
        message: &str,
        processed: i64,
        failed: i64,
    ) -> Result<Reconciled<Model>, RepositoryError> {
        let now = Utc::now().fixed_offset();
        self.mutate(id, |unit| {
            unit.is_processing()
                && unit.attempt == attempt
                && unit
                    .fail_processing(message, processed, failed, now)
                    .is_ok()
        })
        .await
    }

    /// Forces a stale in-flight unit to `failed`. The staleness check is
    /// repeated under the row lock so a unit resumed since the scan survives.
    pub async fn reap(
        &self,
        id: Uuid,
        cutoff: DateTimeWithTimeZone,
    ) -> Result<Reconciled<Model>, RepositoryError> {
        let now = Utc::now().fixed_offset();
        self.mutate(id, |unit| {
            let stale = unit.started_at.is_some_and(|started| started < cutoff);
            if !(unit.is_processing() && stale) {
                return false;
            }
            let (processed, failed) = (unit.processed_count, unit.failed_count);
            unit.fail_processing(STALE_ERROR_MESSAGE, processed, failed, now)
                .is_ok()
        })
        .await
    }

    /// Operator retry of a failed unit. It stays `retrying` until the next
    /// dispatch picks it up.
    pub async fn retry(&self, tenant_id: Uuid, period: Period) -> Result<Model, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let mut unit = Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::Period.eq(period.to_string()))
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| {
                RepositoryError::not_found(format!("work unit {period} for tenant {tenant_id}"))
            })?;

        unit.prepare_retry(now).map_err(|err| match err {
            WorkUnitError::NotRetryable { .. } | WorkUnitError::Completed { .. } => {
                RepositoryError::conflict(err.to_string())
            }
        })?;

        let updated = unit.into_active_model().reset_all().update(&txn).await?;
        txn.commit().await?;

        info!(
            %tenant_id,
            %period,
            retry_count = updated.retry_count,
            "Work unit queued for retry by operator"
        );
        Ok(updated)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, RepositoryError> {
        let rows: Vec<(WorkUnitStatus, i64)> = Entity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Column::Id.count(), "count")
            .group_by(Column::Status)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match status {
                WorkUnitStatus::Pending => counts.pending = count,
                WorkUnitStatus::Running => counts.running = count,
                WorkUnitStatus::Completed => counts.completed = count,
                WorkUnitStatus::Failed => counts.failed = count,
                WorkUnitStatus::Retrying => counts.retrying = count,
            }
        }
        Ok(counts)
    }

    async fn mutate<F>(&self, id: Uuid, apply: F) -> Result<Reconciled<Model>, RepositoryError>
    where
        F: FnOnce(&mut Model) -> bool + Send,
    {
        let txn = self.db.begin().await?;
        let Some(mut unit) = Entity::find_by_id(id).lock_exclusive().one(&txn).await? else {
            warn!(work_unit_id = %id, "Work unit vanished before reconciliation");
            return Ok(Reconciled::Discarded);
        };

        if !apply(&mut unit) {
            txn.commit().await?;
            return Ok(Reconciled::Discarded);
        }

        let updated = unit.into_active_model().reset_all().update(&txn).await?;
        txn.commit().await?;
        Ok(Reconciled::Applied(updated))
    }
}

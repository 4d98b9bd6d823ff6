//! # Tenant Repository
//!
//! Data access for the tenant registry. Transitions are applied to a row
//! loaded under `SELECT ... FOR UPDATE` inside a transaction; the pure state
//! machine on [`Model`] decides what changes.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use uuid::Uuid;

use crate::error::{RepositoryError, is_unique_violation};
use crate::models::tenant::{Column, Entity, Model, RunStatus, TenantKind, TenantStatus};
use crate::models::work_unit;
use crate::period::Period;
use crate::repositories::Reconciled;

/// Input for onboarding a tenant.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub name: String,
    pub kind: TenantKind,
    pub priority: i32,
    pub max_failures: i32,
}

/// Repository for tenant registry operations
#[derive(Clone)]
pub struct TenantRepository {
    db: DatabaseConnection,
}

impl TenantRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Onboards a tenant. New tenants get their backfill window and one
    /// pending work unit per month up to the current one.
    pub async fn create(
        &self,
        new: NewTenant,
        backfill_months: u32,
        max_retries: i32,
    ) -> Result<Model, RepositoryError> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(RepositoryError::validation_error("tenant name cannot be empty"));
        }
        if new.max_failures < 1 {
            return Err(RepositoryError::validation_error(
                "max_failures must be at least 1",
            ));
        }

        let now = Utc::now().fixed_offset();
        let mut tenant = Model {
            id: Uuid::new_v4(),
            name,
            enabled: true,
            status: TenantStatus::Active,
            kind: TenantKind::Existing,
            priority: new.priority,
            failure_count: 0,
            max_failures: new.max_failures,
            last_run_status: RunStatus::Pending,
            last_run_at: None,
            run_started_at: None,
            attempt: 0,
            backfill_start_period: None,
            backfill_completed: false,
            current_period_cursor: None,
            last_completed_period: None,
            created_at: now,
            updated_at: now,
        };
        if new.kind == TenantKind::New {
            tenant.begin_backfill(backfill_months, now);
        }

        let txn = self.db.begin().await?;
        let created = tenant
            .into_active_model()
            .reset_all()
            .insert(&txn)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    RepositoryError::conflict("a tenant with this name already exists")
                } else {
                    RepositoryError::database_error(err)
                }
            })?;

        if let Some(start) = created.backfill_start() {
            insert_pending_units(&txn, created.id, start, max_retries, now).await?;
        }
        txn.commit().await?;

        tracing::info!(
            tenant_id = %created.id,
            name = %created.name,
            kind = ?created.kind,
            backfill_start = ?created.backfill_start_period,
            "Tenant onboarded"
        );
        Ok(created)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Model>, RepositoryError> {
        Ok(Entity::find_by_id(id).one(&self.db).await?)
    }

    /// Like [`find`](Self::find) but a missing tenant is an error.
    pub async fn get(&self, id: Uuid) -> Result<Model, RepositoryError> {
        self.find(id)
            .await?
            .ok_or_else(|| RepositoryError::not_found(format!("tenant {id}")))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Model>, RepositoryError> {
        Ok(Entity::find()
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?)
    }

    pub async fn list_all(&self) -> Result<Vec<Model>, RepositoryError> {
        Ok(Entity::find()
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::Name)
            .all(&self.db)
            .await?)
    }

    /// Tenants passing the eligibility predicate. Unordered; callers apply
    /// the selection order.
    pub async fn list_eligible(&self) -> Result<Vec<Model>, RepositoryError> {
        Ok(Entity::find()
            .filter(Column::Enabled.eq(true))
            .filter(Column::Status.eq(TenantStatus::Active))
            .filter(Column::LastRunStatus.ne(RunStatus::Running))
            .filter(Expr::col(Column::FailureCount).lt(Expr::col(Column::MaxFailures)))
            .all(&self.db)
            .await?)
    }

    pub async fn list_running(&self) -> Result<Vec<Model>, RepositoryError> {
        Ok(Entity::find()
            .filter(Column::LastRunStatus.eq(RunStatus::Running))
            .order_by_asc(Column::RunStartedAt)
            .all(&self.db)
            .await?)
    }

    /// Active and enabled tenants, the candidate set of a parallel cycle.
    pub async fn list_active_enabled(&self) -> Result<Vec<Model>, RepositoryError> {
        Ok(Entity::find()
            .filter(Column::Enabled.eq(true))
            .filter(Column::Status.eq(TenantStatus::Active))
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?)
    }

    /// Running tenants whose claim is older than `cutoff`.
    pub async fn list_stale_running(
        &self,
        cutoff: DateTimeWithTimeZone,
    ) -> Result<Vec<Model>, RepositoryError> {
        Ok(Entity::find()
            .filter(Column::LastRunStatus.eq(RunStatus::Running))
            .filter(
                Column::RunStartedAt
                    .lt(cutoff)
                    .or(Column::RunStartedAt.is_null()),
            )
            .all(&self.db)
            .await?)
    }

    /// Atomically claims an eligible tenant: `running`, claim timestamp, and a
    /// fresh attempt token. Returns `None` when the tenant is no longer
    /// eligible (another cycle won the race, or its state changed).
    pub async fn try_mark_running(&self, id: Uuid) -> Result<Option<Model>, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let result = Entity::update_many()
            .col_expr(
                Column::LastRunStatus,
                Expr::value(RunStatus::Running.into_value()),
            )
            .col_expr(Column::RunStartedAt, Expr::value(now))
            .col_expr(Column::Attempt, Expr::col(Column::Attempt).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Enabled.eq(true))
            .filter(Column::Status.eq(TenantStatus::Active))
            .filter(Column::LastRunStatus.ne(RunStatus::Running))
            .filter(Expr::col(Column::FailureCount).lt(Expr::col(Column::MaxFailures)))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.commit().await?;
            return Ok(None);
        }

        let claimed = Entity::find_by_id(id).one(&txn).await?;
        txn.commit().await?;

        if let Some(tenant) = &claimed {
            tracing::debug!(tenant_id = %tenant.id, attempt = tenant.attempt, "Tenant claimed");
        }
        Ok(claimed)
    }

    /// Records a successful run for the claim identified by `attempt`.
    pub async fn record_success(
        &self,
        id: Uuid,
        attempt: i32,
    ) -> Result<Reconciled<Model>, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let updated = self
            .mutate(id, |tenant| {
                if !holds_claim(tenant, attempt) {
                    return false;
                }
                tenant.record_success(now);
                true
            })
            .await?;

        Ok(reconciled(updated))
    }

    /// Records a failed run against the claim identified by `attempt`.
    pub async fn record_failure(
        &self,
        id: Uuid,
        attempt: i32,
        cause: &str,
    ) -> Result<Reconciled<Model>, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let mut disabled = false;
        let updated = self
            .mutate(id, |tenant| {
                if !holds_claim(tenant, attempt) {
                    return false;
                }
                disabled = tenant.record_failure(now);
                true
            })
            .await?;

        if let Some(tenant) = &updated {
            if disabled {
                tracing::warn!(
                    tenant_id = %tenant.id,
                    failure_count = tenant.failure_count,
                    max_failures = tenant.max_failures,
                    cause,
                    "Tenant disabled after reaching failure limit"
                );
            } else {
                tracing::info!(
                    tenant_id = %tenant.id,
                    failure_count = tenant.failure_count,
                    cause,
                    "Tenant run failed"
                );
            }
        }

        Ok(reconciled(updated))
    }

    /// Gives back a claim that never reached the pipeline.
    pub async fn release_claim(
        &self,
        id: Uuid,
        attempt: i32,
    ) -> Result<Reconciled<Model>, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let updated = self
            .mutate(id, |tenant| {
                if !holds_claim(tenant, attempt) {
                    return false;
                }
                tenant.release(now);
                true
            })
            .await?;
        Ok(reconciled(updated))
    }

    /// Operator reset. An in-flight run's late result is discarded afterwards.
    pub async fn reset(&self, id: Uuid) -> Result<Model, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let updated = self.apply(id, |tenant| tenant.reset(now)).await?;
        tracing::info!(tenant_id = %id, "Tenant reset by operator");
        Ok(updated)
    }

    pub async fn activate(&self, id: Uuid) -> Result<Model, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let updated = self.apply(id, |tenant| tenant.activate(now)).await?;
        tracing::info!(tenant_id = %id, "Tenant activated");
        Ok(updated)
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<Model, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let updated = self.apply(id, |tenant| tenant.deactivate(now)).await?;
        tracing::info!(tenant_id = %id, "Tenant deactivated");
        Ok(updated)
    }

    /// Advances the backfill cursor past a completed period.
    pub async fn record_period_completed(
        &self,
        id: Uuid,
        period: Period,
        current: Period,
    ) -> Result<Model, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let updated = self
            .apply(id, |tenant| {
                if tenant.needs_backfill() {
                    tenant.record_period_completed(period, current, now);
                }
            })
            .await?;

        tracing::debug!(
            tenant_id = %id,
            %period,
            backfill_completed = updated.backfill_completed,
            "Backfill cursor advanced"
        );
        Ok(updated)
    }

    /// Converts a finished backfilling tenant to an existing tenant.
    pub async fn complete_backfill(&self, id: Uuid) -> Result<Model, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let updated = self
            .apply(id, |tenant| tenant.complete_backfill(now))
            .await?;
        tracing::info!(tenant_id = %id, "Backfill completed; tenant is now existing");
        Ok(updated)
    }

    /// Restarts a tenant as new: drops its ledger, reopens the backfill
    /// window, and clears failure state. Refused while a run is in flight.
    pub async fn convert_to_new(
        &self,
        id: Uuid,
        backfill_months: u32,
        max_retries: i32,
    ) -> Result<Model, RepositoryError> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let mut tenant = Entity::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| RepositoryError::not_found(format!("tenant {id}")))?;

        if tenant.is_running() {
            return Err(RepositoryError::conflict(
                "tenant has a run in flight; retry once it finishes",
            ));
        }

        work_unit::Entity::delete_many()
            .filter(work_unit::Column::TenantId.eq(id))
            .exec(&txn)
            .await?;

        tenant.begin_backfill(backfill_months, now);
        tenant.reset(now);
        let updated = tenant.into_active_model().reset_all().update(&txn).await?;

        if let Some(start) = updated.backfill_start() {
            insert_pending_units(&txn, id, start, max_retries, now).await?;
        }
        txn.commit().await?;

        tracing::info!(
            tenant_id = %id,
            backfill_start = ?updated.backfill_start_period,
            "Tenant converted to new"
        );
        Ok(updated)
    }

    /// Applies an unconditional transition.
    async fn apply<F>(&self, id: Uuid, apply: F) -> Result<Model, RepositoryError>
    where
        F: FnOnce(&mut Model) + Send,
    {
        self.mutate(id, |tenant| {
            apply(tenant);
            true
        })
        .await?
        .ok_or_else(|| RepositoryError::not_found(format!("tenant {id}")))
    }

    /// Loads the tenant under a row lock and persists it when `apply`
    /// returns `true`. `Ok(None)` means the guard rejected the transition.
    async fn mutate<F>(&self, id: Uuid, apply: F) -> Result<Option<Model>, RepositoryError>
    where
        F: FnOnce(&mut Model) -> bool + Send,
    {
        let txn = self.db.begin().await?;
        let mut tenant = Entity::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| RepositoryError::not_found(format!("tenant {id}")))?;

        if !apply(&mut tenant) {
            txn.commit().await?;
            return Ok(None);
        }

        let updated = tenant.into_active_model().reset_all().update(&txn).await?;
        txn.commit().await?;
        Ok(Some(updated))
    }
}

/// The claim identified by `attempt` is still the live one.
fn holds_claim(tenant: &Model, attempt: i32) -> bool {
    tenant.is_running() && tenant.attempt == attempt
}

fn reconciled(updated: Option<Model>) -> Reconciled<Model> {
    match updated {
        Some(tenant) => Reconciled::Applied(tenant),
        None => Reconciled::Discarded,
    }
}

/// Inserts one pending unit per month from `start` through the current month.
async fn insert_pending_units(
    txn: &DatabaseTransaction,
    tenant_id: Uuid,
    start: Period,
    max_retries: i32,
    now: DateTimeWithTimeZone,
) -> Result<(), RepositoryError> {
    let periods = Period::range_inclusive(start, Period::containing(now.to_utc()));
    if periods.is_empty() {
        return Ok(());
    }

    let units: Vec<work_unit::ActiveModel> = periods
        .into_iter()
        .map(|period| {
            work_unit::Model::new_pending(tenant_id, period, max_retries, now)
                .into_active_model()
                .reset_all()
        })
        .collect();

    work_unit::Entity::insert_many(units).exec(txn).await?;
    Ok(())
}

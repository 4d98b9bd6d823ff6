//! Eligibility selection.

use std::cmp::Ordering;

use metrics::gauge;

use crate::error::RepositoryError;
use crate::models::tenant::Model as Tenant;
use crate::repositories::TenantRepository;
use crate::telemetry::ELIGIBLE_TENANTS;

/// Reads the tenants currently allowed to run, in selection order.
#[derive(Clone)]
pub struct EligibilitySelector {
    tenants: TenantRepository,
}

impl EligibilitySelector {
    pub fn new(tenants: TenantRepository) -> Self {
        Self { tenants }
    }

    /// Eligible tenants ordered by priority, then least recently run (never
    /// run first). An empty list is a quiescent system, not an error.
    pub async fn list_eligible(&self) -> Result<Vec<Tenant>, RepositoryError> {
        let mut eligible = self.tenants.list_eligible().await?;
        // The database filter is authoritative, this only guards the invariant.
        eligible.retain(Tenant::is_eligible);
        eligible.sort_by(selection_order);
        gauge!(ELIGIBLE_TENANTS).set(eligible.len() as f64);
        Ok(eligible)
    }
}

/// `priority` ascending, `last_run_at` ascending with nulls first, then id so
/// the order is total.
pub fn selection_order(a: &Tenant, b: &Tenant) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.last_run_at.cmp(&b.last_run_at))
        .then_with(|| a.id.cmp(&b.id))
}

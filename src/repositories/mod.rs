//! # Repository Layer
//!
//! Repositories wrap SeaORM access to the tenant registry and the work-unit
//! ledger. Every state transition is a single transaction over one tenant or
//! one unit, so per-tenant transitions are totally ordered while different
//! tenants never contend with each other.

pub mod tenant;
pub mod work_unit;

pub use tenant::{NewTenant, TenantRepository};
pub use work_unit::WorkUnitRepository;

/// Result of a guarded transition.
///
/// Completion handlers carry the attempt token handed out at claim time. When
/// the row has since moved on (reclaimed, reset, or claimed again) the
/// transition is not applied and the caller gets `Discarded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled<T> {
    Applied(T),
    Discarded,
}

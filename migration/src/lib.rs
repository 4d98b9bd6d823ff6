//! Database migrations for the batch orchestrator.
//!
//! Schema for the tenant registry and the work-unit ledger, managed with
//! SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_01_01_000001_create_tenants;
mod m2025_01_01_000002_create_work_units;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_01_000001_create_tenants::Migration),
            Box::new(m2025_01_01_000002_create_work_units::Migration),
        ]
    }
}

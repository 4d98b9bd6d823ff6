//! Demo tenant seeding
//!
//! Seeds five existing tenants, `ADV001` through `ADV005`, with rotation
//! priorities 0 through 4. Tenants that already exist are left untouched, so
//! the seed can run on every start.

use anyhow::Result;
use sea_orm::DatabaseConnection;

use crate::config::SchedulerConfig;
use crate::models::tenant::TenantKind;
use crate::repositories::{NewTenant, TenantRepository};

const DEMO_TENANTS: [(&str, i32); 5] = [
    ("ADV001", 0),
    ("ADV002", 1),
    ("ADV003", 2),
    ("ADV004", 3),
    ("ADV005", 4),
];

/// Creates the demo tenants that do not exist yet. Returns how many were
/// created.
pub async fn seed_demo_tenants(db: &DatabaseConnection, scheduler: &SchedulerConfig) -> Result<usize> {
    let repo = TenantRepository::new(db.clone());
    let mut created = 0;

    for (name, priority) in DEMO_TENANTS {
        if repo.find_by_name(name).await?.is_some() {
            log::info!("Tenant '{}' already exists, skipping", name);
            continue;
        }

        log::info!("Creating demo tenant: {}", name);
        repo.create(
            NewTenant {
                name: name.to_string(),
                kind: TenantKind::Existing,
                priority,
                max_failures: scheduler.default_max_failures,
            },
            scheduler.backfill_months,
            scheduler.default_max_retries,
        )
        .await?;
        created += 1;
    }

    Ok(created)
}

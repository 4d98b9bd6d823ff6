//! # Data Models
//!
//! SeaORM entities for the tenant registry and the work-unit ledger.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod tenant;
pub mod work_unit;

pub use tenant::Entity as Tenant;
pub use work_unit::Entity as WorkUnit;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "batch-orchestrator".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

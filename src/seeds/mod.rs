//! Database seeding functionality
//!
//! Demo data for local development: a handful of sample tenants so the
//! orchestrator has something to rotate through.

pub mod tenant;

pub use tenant::seed_demo_tenants;

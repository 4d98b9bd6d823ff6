//! # Batch Orchestrator Library
//!
//! Fault-isolating scheduler that runs a shared data pipeline for many
//! tenants: tenant registry and work-unit ledger, round-robin and parallel
//! orchestrators, backfill sequencing, stale-run reclamation, and the admin
//! API on top.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod period;
pub mod pipeline;
pub mod repositories;
pub mod scheduler;
pub mod seeds;
pub mod server;
pub mod telemetry;
pub use migration;

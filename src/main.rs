//! # Batch Orchestrator Main Entry Point

use anyhow::Context;
use batch_orchestrator::{
    config::{ConfigLoader, SchedulerMode},
    db,
    seeds::seed_demo_tenants,
    server::run_server,
    telemetry,
};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "batch-orchestrator", version, about = "Multi-tenant batch orchestrator")]
struct Cli {
    /// Override the scheduling strategy (`round_robin` or `parallel`)
    #[arg(long, global = true)]
    mode: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Apply migrations, then run the admin API, orchestrator and reaper
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Insert the demo tenants ADV001 through ADV005
    Seed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let mut config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    if let Some(mode) = cli.mode.as_deref() {
        config.scheduler.mode = mode.parse::<SchedulerMode>()?;
    }

    telemetry::init_tracing(&config)?;
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::info!(profile = %config.profile, config = %redacted_json, "Loaded configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            db::migrate(&db).await?;
            run_server(config, db).await
        }
        Command::Migrate => db::migrate(&db).await,
        Command::Seed => {
            db::migrate(&db).await?;
            let created = seed_demo_tenants(&db, &config.scheduler).await?;
            tracing::info!(created, "Demo tenants seeded");
            Ok(())
        }
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wpinv_core::normalize_site_url;
use wpinv_storage::PgStore;
use wpinv_sync::{Engine, EngineConfig};
use wpinv_web::WebConfig;

#[derive(Debug, Parser)]
#[command(name = "wpinv")]
#[command(about = "Managed site inventory reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the watcher, the legacy mirror and the HTTP API.
    Serve,
    /// Mirror the legacy document set once and print the report.
    Sync,
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Print the object name and inventory host derived from a site URL.
    ObjectName { url: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("WPINV_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn serve() -> Result<()> {
    let engine = Arc::new(Engine::from_env().await?);
    let tasks = engine.spawn();
    let scheduler = engine.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting resync scheduler")?;
        info!("resync scheduler started");
    }

    let result = wpinv_web::serve(Arc::clone(&engine), WebConfig::from_env()).await;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping resync scheduler")?;
    }
    for task in tasks {
        task.abort();
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Sync => {
            let report = wpinv_sync::run_mirror_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let config = EngineConfig::from_env();
            match config.database_url {
                Some(url) => {
                    PgStore::connect(&url).await?.migrate().await?;
                    println!("migrations applied");
                }
                None => eprintln!("DATABASE_URL is not set; snapshot stores need no migration"),
            }
        }
        Commands::ObjectName { url } => {
            let deriver = EngineConfig::from_env().key_deriver();
            let url = normalize_site_url(&url)?;
            println!("object name:    {}", deriver.object_name(&url)?);
            println!("inventory host: {}", deriver.inventory_host(&url)?);
        }
    }

    Ok(())
}

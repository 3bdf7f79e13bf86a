use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_engine::{ExecutorReaper, JobScheduler, ReaperConfig, SchedulerConfig};
use conveyor_store::{EngineStore, PgEngineStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_engine=debug,conveyor_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL environment variable required");
    let store = PgEngineStore::connect(&database_url)
        .await?
        .with_principal("conveyor-scheduler");
    store.migrate().await?;
    tracing::info!("database connection established");

    let store: Arc<dyn EngineStore> = Arc::new(store);
    let scheduler = JobScheduler::new(Arc::clone(&store), SchedulerConfig::default());
    let reaper = ExecutorReaper::new(Arc::clone(&store), ReaperConfig::default());

    scheduler.start().await?;
    reaper.start();
    tracing::info!("scheduler ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    scheduler.shutdown().await;
    reaper.shutdown().await;

    Ok(())
}

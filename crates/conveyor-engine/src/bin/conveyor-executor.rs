use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_engine::{ExecutorConfig, ExecutorRuntime, HttpTaskDriver};
use conveyor_store::PgEngineStore;

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
        .with_principal("conveyor-executor");
    store.migrate().await?;
    tracing::info!("database connection established");

    let runtime = ExecutorRuntime::new(
        Arc::new(store),
        Arc::new(HttpTaskDriver::new()),
        ExecutorConfig::default(),
    );
    let executor_id = runtime.start().await?;
    tracing::info!(%executor_id, "executor ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    runtime.shutdown().await?;

    Ok(())
}

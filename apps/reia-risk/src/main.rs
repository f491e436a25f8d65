use anyhow::Result;
use clap::Parser;
use reia_risk::cli::{dispatch, Cli};
use reia_risk::config::Config;
use reia_risk::db::build_pool;
use reia_risk::telemetry::{init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(config.otlp_endpoint.as_deref())?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let outcome = dispatch(cli.command, &config, pool.clone()).await;
    if let Err(err) = &outcome {
        tracing::error!(error = %err, "command failed");
    }

    pool.close().await;
    shutdown_tracing();
    outcome
}

use std::sync::Arc;

use anyhow::Context;

use flowserver::api_router::build_router;
use flowserver::config::AppConfig;
use flowserver::core::state::{run_migrations, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let state = Arc::new(AppState::new(config)?);

    run_migrations(&state.conn).context("failed to run database migrations")?;

    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("flowserver listening on {addr}");
    axum::serve(listener, build_router(state)).await?;

    Ok(())
}
